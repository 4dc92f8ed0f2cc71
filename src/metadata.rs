// src/metadata.rs

use crate::config::{parse_url, Config, ConfigError};
use crate::models::Transfer;
use crate::transport::{Request, ResponseMeta, Transport, TransportError};
use percent_encoding::percent_decode_str;
use thiserror::Error;
use tracing::{debug, info};

const FALLBACK_FILENAME: &str = "download";

#[derive(Debug, Error)]
pub enum MetadataError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("probe request failed: {0}")]
    Transport(#[from] TransportError),
    #[error("unexpected status code {status} from {url}")]
    Status { status: u16, url: String },
}

/// Probes `config.url` and describes the transfer it points to.
///
/// A HEAD request is tried first. Servers that refuse HEAD (405/501) get a
/// GET instead, whose body is dropped without being read.
pub async fn resolve(transport: &dyn Transport, config: &Config) -> Result<Transfer, MetadataError> {
    let url = parse_url(&config.url)?;
    let configured = config.configured_filename()?;

    let mut response = transport.send(Request::head(url.as_str())).await?;
    if matches!(response.meta.status, 405 | 501) {
        debug!(url = %url, status = response.meta.status, "HEAD refused, probing with GET");
        response = transport.send(Request::get(url.as_str())).await?;
    }
    let meta = response.meta;
    drop(response.body);

    if !meta.is_success() {
        return Err(MetadataError::Status {
            status: meta.status,
            url: url.to_string(),
        });
    }

    let origin_url = if meta.url.is_empty() {
        url.to_string()
    } else {
        meta.url.clone()
    };
    let filename = match configured {
        Some(name) => name.to_string(),
        None => detect_filename(&origin_url),
    };

    let transfer = Transfer {
        source_url: url.to_string(),
        origin_url,
        total_size: meta.content_length,
        resumable: supports_ranges(&meta),
        root_path: config.root_path.clone(),
        filename,
        concurrency: config.concurrency,
        copy_buffer_size: config.copy_buffer_size,
        validator: validator(&meta),
        probe: meta,
    };
    info!(
        url = %transfer.origin_url,
        filename = %transfer.filename,
        size = ?transfer.total_size,
        resumable = transfer.resumable,
        "resolved metadata"
    );
    Ok(transfer)
}

fn supports_ranges(meta: &ResponseMeta) -> bool {
    meta.status != 206
        && meta
            .accept_ranges
            .as_deref()
            .is_some_and(|v| v.trim().eq_ignore_ascii_case("bytes"))
}

/// `If-Range` only accepts strong entity tags, so weak ones fall back to the date.
fn validator(meta: &ResponseMeta) -> Option<String> {
    meta.etag
        .clone()
        .filter(|tag| !tag.starts_with("W/"))
        .or_else(|| meta.last_modified.clone())
}

fn detect_filename(origin_url: &str) -> String {
    let last_segment = url::Url::parse(origin_url)
        .ok()
        .and_then(|u| {
            u.path_segments()
                .and_then(|mut segments| segments.next_back())
                .map(|s| percent_decode_str(s).decode_utf8_lossy().into_owned())
        })
        .unwrap_or_default();
    let name = sanitize_filename(&last_segment);
    if name.is_empty() {
        FALLBACK_FILENAME.to_string()
    } else {
        name
    }
}

/// Turns a raw path segment into a lower-case, underscore-separated filename.
///
/// - The text after the last `.` (when something precedes it) is kept as the
///   extension, lower-cased and reduced to ASCII letters and digits.
/// - In the stem, a lower-case letter or digit followed by an upper-case letter
///   starts a new word, as does the last capital of an acronym followed by a
///   lower-case letter (`HTTPServer` -> `http_server`).
/// - Any run of non-alphanumeric characters separates words. Path separators,
///   reserved characters and control characters never survive.
/// - Words are lower-cased and joined with single underscores.
///
/// Returns an empty string when nothing usable is left.
pub fn sanitize_filename(raw: &str) -> String {
    let raw = raw.trim();
    let (stem, extension) = match raw.rfind('.') {
        Some(pos) if pos > 0 => (&raw[..pos], &raw[pos + 1..]),
        _ => (raw, ""),
    };

    let stem = snake_case(stem);
    let extension: String = extension
        .chars()
        .filter(|c| c.is_ascii_alphanumeric())
        .map(|c| c.to_ascii_lowercase())
        .collect();

    match (stem.is_empty(), extension.is_empty()) {
        (false, false) => format!("{}.{}", stem, extension),
        (false, true) => stem,
        (true, _) => extension,
    }
}

fn snake_case(input: &str) -> String {
    let chars: Vec<char> = input.chars().collect();
    let mut words: Vec<String> = Vec::new();
    let mut current = String::new();

    for (i, &c) in chars.iter().enumerate() {
        if !c.is_alphanumeric() {
            if !current.is_empty() {
                words.push(std::mem::take(&mut current));
            }
            continue;
        }
        if c.is_uppercase() && !current.is_empty() {
            let prev = chars[i - 1];
            let next_is_lower = chars.get(i + 1).is_some_and(|n| n.is_lowercase());
            if prev.is_lowercase() || prev.is_numeric() || (prev.is_uppercase() && next_is_lower) {
                words.push(std::mem::take(&mut current));
            }
        }
        current.extend(c.to_lowercase());
    }
    if !current.is_empty() {
        words.push(current);
    }
    words.join("_")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::Response;
    use async_trait::async_trait;
    use std::sync::Mutex;

    struct Scripted {
        responses: Mutex<Vec<ResponseMeta>>,
        seen: Mutex<Vec<Request>>,
    }

    impl Scripted {
        fn new(mut responses: Vec<ResponseMeta>) -> Self {
            responses.reverse();
            Self {
                responses: Mutex::new(responses),
                seen: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl Transport for Scripted {
        async fn send(&self, request: Request) -> Result<Response, TransportError> {
            self.seen.lock().unwrap().push(request);
            let meta = self.responses.lock().unwrap().pop().expect("unexpected request");
            Ok(Response::empty(meta))
        }
    }

    fn ok_meta(url: &str) -> ResponseMeta {
        ResponseMeta {
            status: 200,
            url: url.to_string(),
            content_length: Some(4096),
            accept_ranges: Some("bytes".into()),
            etag: Some("\"v1\"".into()),
            last_modified: None,
        }
    }

    #[test]
    fn sanitize_examples() {
        assert_eq!(sanitize_filename("My Video File.MP4"), "my_video_file.mp4");
        assert_eq!(sanitize_filename("myVideo31231.mp4"), "my_video31231.mp4");
        assert_eq!(sanitize_filename("HTTPServerLog.txt"), "http_server_log.txt");
        assert_eq!(sanitize_filename("some-file  name (1).zip"), "some_file_name_1.zip");
        assert_eq!(sanitize_filename("archive.tar.gz"), "archive_tar.gz");
        assert_eq!(sanitize_filename("README"), "readme");
    }

    #[test]
    fn sanitize_strips_unsafe_characters() {
        let name = sanitize_filename("a<b>c:d*e?f|g\"h\\i.txt");
        assert_eq!(name, "a_b_c_d_e_f_g_h_i.txt");
        for bad in ['/', '\\', ':', '*', '?', '"', '<', '>', '|'] {
            assert!(!name.contains(bad));
        }
        assert_eq!(sanitize_filename("tab\there\u{7}.bin"), "tab_here.bin");
    }

    #[test]
    fn sanitize_has_no_stray_underscores() {
        for raw in ["__x__.bin", "--x--", "  spaced out  .dat", "x..y"] {
            let name = sanitize_filename(raw);
            assert!(!name.starts_with('_'), "{name}");
            assert!(!name.contains("__"), "{name}");
            assert!(!name.contains("_."), "{name}");
        }
    }

    #[test]
    fn sanitize_edge_cases() {
        assert_eq!(sanitize_filename(""), "");
        assert_eq!(sanitize_filename(".bashrc"), "bashrc");
        assert_eq!(sanitize_filename("file.e x!t"), "file.ext");
        assert_eq!(sanitize_filename("???"), "");
    }

    #[test]
    fn filename_comes_from_final_path_segment() {
        assert_eq!(
            detect_filename("https://cdn.example.com/media/MyClip.MP4?sig=abc"),
            "my_clip.mp4"
        );
        assert_eq!(detect_filename("https://example.com/"), FALLBACK_FILENAME);
    }

    #[test]
    fn encoded_path_segment_is_decoded_first() {
        assert_eq!(detect_filename("https://example.com/My%20Video.mp4"), "my_video.mp4");
        assert_eq!(detect_filename("https://example.com/a%2Fb%5Cc.txt"), "a_b_c.txt");
        assert_eq!(detect_filename("https://example.com/caf%C3%A9%20menu.pdf"), "café_menu.pdf");
    }

    #[tokio::test]
    async fn resolve_reads_size_ranges_and_redirect() {
        let transport = Scripted::new(vec![ok_meta("https://mirror.example.com/files/BigFile.iso")]);
        let config = Config::new("https://example.com/latest");

        let transfer = resolve(&transport, &config).await.unwrap();

        assert_eq!(transfer.source_url, "https://example.com/latest");
        assert_eq!(transfer.origin_url, "https://mirror.example.com/files/BigFile.iso");
        assert_eq!(transfer.filename, "big_file.iso");
        assert_eq!(transfer.total_size, Some(4096));
        assert!(transfer.resumable);
        assert_eq!(transfer.validator.as_deref(), Some("\"v1\""));
        assert_eq!(transport.seen.lock().unwrap()[0], Request::head("https://example.com/latest"));
    }

    #[tokio::test]
    async fn missing_accept_ranges_is_not_resumable() {
        let mut meta = ok_meta("https://example.com/a.bin");
        meta.accept_ranges = None;
        let transport = Scripted::new(vec![meta]);
        let transfer = resolve(&transport, &Config::new("https://example.com/a.bin"))
            .await
            .unwrap();
        assert!(!transfer.resumable);
    }

    #[tokio::test]
    async fn accept_ranges_none_is_not_resumable() {
        let mut meta = ok_meta("https://example.com/a.bin");
        meta.accept_ranges = Some("none".into());
        let transport = Scripted::new(vec![meta]);
        let transfer = resolve(&transport, &Config::new("https://example.com/a.bin"))
            .await
            .unwrap();
        assert!(!transfer.resumable);
    }

    #[tokio::test]
    async fn head_refusal_falls_back_to_get() {
        let refused = ResponseMeta {
            status: 405,
            url: "https://example.com/a.bin".into(),
            ..ResponseMeta::default()
        };
        let transport = Scripted::new(vec![refused, ok_meta("https://example.com/a.bin")]);
        let transfer = resolve(&transport, &Config::new("https://example.com/a.bin"))
            .await
            .unwrap();

        assert_eq!(transfer.total_size, Some(4096));
        let seen = transport.seen.lock().unwrap();
        assert_eq!(seen.len(), 2);
        assert_eq!(seen[1], Request::get("https://example.com/a.bin"));
    }

    #[tokio::test]
    async fn non_success_status_fails() {
        let not_found = ResponseMeta {
            status: 404,
            ..ResponseMeta::default()
        };
        let transport = Scripted::new(vec![not_found]);
        let err = resolve(&transport, &Config::new("https://example.com/gone"))
            .await
            .unwrap_err();
        assert!(matches!(err, MetadataError::Status { status: 404, .. }));
    }

    #[tokio::test]
    async fn empty_url_fails_without_request() {
        let transport = Scripted::new(vec![]);
        let err = resolve(&transport, &Config::new("")).await.unwrap_err();
        assert!(matches!(err, MetadataError::Config(ConfigError::MissingUrl)));
        assert!(transport.seen.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn configured_filename_wins() {
        let transport = Scripted::new(vec![ok_meta("https://example.com/a.bin")]);
        let mut config = Config::new("https://example.com/a.bin");
        config.filename = Some("Keep Me.BIN".into());
        let transfer = resolve(&transport, &config).await.unwrap();
        assert_eq!(transfer.filename, "Keep Me.BIN");
    }

    #[tokio::test]
    async fn configured_filename_outside_root_fails_without_request() {
        let transport = Scripted::new(vec![]);
        let mut config = Config::new("https://example.com/a.bin");
        config.filename = Some("../../etc/cron.d/job".into());
        let err = resolve(&transport, &config).await.unwrap_err();
        assert!(matches!(err, MetadataError::Config(ConfigError::InvalidFilename(_))));
        assert!(transport.seen.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn weak_etag_falls_back_to_last_modified() {
        let mut meta = ok_meta("https://example.com/a.bin");
        meta.etag = Some("W/\"weak\"".into());
        meta.last_modified = Some("Wed, 21 Oct 2015 07:28:00 GMT".into());
        let transport = Scripted::new(vec![meta]);
        let transfer = resolve(&transport, &Config::new("https://example.com/a.bin"))
            .await
            .unwrap();
        assert_eq!(transfer.validator.as_deref(), Some("Wed, 21 Oct 2015 07:28:00 GMT"));
    }
}
