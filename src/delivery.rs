use std::{
    io::{self, ErrorKind},
    path::Path,
    time::Duration,
};

use axum::{
    body::{Body, Bytes},
    http::{
        HeaderMap, HeaderName, HeaderValue,
        header::{CONTENT_DISPOSITION, CONTENT_LENGTH, CONTENT_TYPE},
    },
    response::{IntoResponse, Response},
};
use futures::{Stream, StreamExt, stream};
use tokio::{fs::File, io::AsyncRead, time::Instant};
use tokio_util::io::ReaderStream;
use tracing::{info, warn};

use crate::{error::ApiError, extractor::MediaInfo};

pub const DOWNLOAD_FILENAME_HEADER: &str = "x-download-filename";

/// `"<title> [<id>].<ext>"`, with path separators removed from the title.
pub fn media_filename(info: &MediaInfo, extension: &str) -> String {
    let title = info
        .title
        .as_deref()
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .unwrap_or("video")
        .replace(['/', '\\'], "_");
    let id = info
        .id
        .as_deref()
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .unwrap_or("unknown");

    format!("{title} [{id}].{extension}")
}

pub fn content_type_for_filename(filename: &str) -> &'static str {
    let extension = Path::new(filename)
        .extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| ext.to_ascii_lowercase())
        .unwrap_or_default();

    match extension.as_str() {
        "mp4" => "video/mp4",
        "webm" => "video/webm",
        "mkv" => "video/x-matroska",
        "mov" => "video/quicktime",
        "mp3" => "audio/mpeg",
        "m4a" => "audio/mp4",
        "aac" => "audio/aac",
        "wav" => "audio/wav",
        "ogg" | "opus" => "audio/ogg",
        "flac" => "audio/flac",
        _ => "application/octet-stream",
    }
}

pub fn build_content_disposition(filename: &str) -> String {
    let safe_ascii = sanitize_ascii_filename(filename);
    format!(
        "attachment; filename=\"{safe_ascii}\"; filename*=UTF-8''{}",
        urlencoding::encode(filename)
    )
}

pub fn sanitize_ascii_filename(value: &str) -> String {
    let sanitized: String = value
        .chars()
        .map(|character| {
            if character.is_ascii_alphanumeric()
                || matches!(character, '.' | '-' | '_' | ' ' | '(' | ')' | '[' | ']')
            {
                character
            } else {
                '_'
            }
        })
        .collect();

    let compact = sanitized.trim();
    if compact.is_empty() {
        "download.bin".to_string()
    } else {
        compact.to_string()
    }
}

pub fn attachment_response(
    filename: &str,
    body: Body,
    content_length: Option<u64>,
) -> Result<Response, ApiError> {
    let mut headers = HeaderMap::new();
    headers.insert(
        CONTENT_TYPE,
        HeaderValue::from_static(content_type_for_filename(filename)),
    );

    if let Some(length) = content_length {
        headers.insert(CONTENT_LENGTH, HeaderValue::from(length));
    }

    headers.insert(
        CONTENT_DISPOSITION,
        HeaderValue::from_str(&build_content_disposition(filename))
            .map_err(|_| ApiError::internal("Could not build the download header."))?,
    );
    headers.insert(
        HeaderName::from_static(DOWNLOAD_FILENAME_HEADER),
        HeaderValue::from_str(&sanitize_ascii_filename(filename))
            .map_err(|_| ApiError::internal("Could not build the filename header."))?,
    );

    Ok((headers, body).into_response())
}

/// Keeps `guard` alive for as long as the body stream is.
fn guarded<S, G>(inner: S, guard: G) -> impl Stream<Item = S::Item> + Send + 'static
where
    S: Stream + Send + 'static,
    G: Send + 'static,
{
    inner.map(move |chunk| {
        let _guard = &guard;
        chunk
    })
}

pub async fn file_body<G>(path: &Path, guard: G) -> Result<Body, ApiError>
where
    G: Send + 'static,
{
    let file = File::open(path)
        .await
        .map_err(|error| ApiError::internal(format!("Could not open the downloaded file: {error}")))?;

    Ok(open_file_body(file, guard))
}

/// Streams a file that is already open, so it stays readable even if its
/// folder is removed mid-transfer.
pub fn open_file_body<G>(file: File, guard: G) -> Body
where
    G: Send + 'static,
{
    Body::from_stream(guarded(ReaderStream::new(file), guard))
}

/// Relays a child's stdout until `deadline`. Past it the body ends with an
/// error, which drops the guard and so kills the pipeline.
pub fn pipe_body<R, G>(
    first_chunk: Bytes,
    rest: ReaderStream<R>,
    deadline: Instant,
    guard: G,
) -> Body
where
    R: AsyncRead + Unpin + Send + 'static,
    G: Send + 'static,
{
    let head = stream::once(async move { Ok::<_, io::Error>(first_chunk) });
    let tail = stream::unfold(Some(rest), move |state| async move {
        let Some(mut reader) = state else {
            return None;
        };
        match tokio::time::timeout_at(deadline, reader.next()).await {
            Ok(Some(chunk)) => Some((chunk, Some(reader))),
            Ok(None) => None,
            Err(_) => {
                warn!("stream relay hit its time limit, stopping the pipeline");
                let error = io::Error::new(ErrorKind::TimedOut, "stream time limit reached");
                Some((Err(error), None))
            }
        }
    });

    Body::from_stream(guarded(head.chain(tail), guard))
}

pub async fn cleanup_stale_entries(dir: &Path, max_age: Duration) {
    if max_age.is_zero() {
        return;
    }

    let mut entries = match tokio::fs::read_dir(dir).await {
        Ok(entries) => entries,
        Err(error) => {
            if error.kind() != ErrorKind::NotFound {
                warn!("could not open {:?} for cleanup: {error}", dir);
            }
            return;
        }
    };

    let now = std::time::SystemTime::now();
    let mut removed = 0usize;

    loop {
        let entry = match entries.next_entry().await {
            Ok(Some(entry)) => entry,
            Ok(None) => break,
            Err(error) => {
                warn!("could not iterate {:?} for cleanup: {error}", dir);
                break;
            }
        };

        let path = entry.path();
        let Ok(metadata) = entry.metadata().await else {
            continue;
        };
        let age = metadata
            .modified()
            .ok()
            .and_then(|modified_at| now.duration_since(modified_at).ok())
            .unwrap_or_default();
        if age < max_age {
            continue;
        }

        let result = if metadata.is_dir() {
            tokio::fs::remove_dir_all(&path).await
        } else {
            tokio::fs::remove_file(&path).await
        };
        match result {
            Ok(()) => removed += 1,
            Err(error) if error.kind() == ErrorKind::NotFound => {}
            Err(error) => warn!("could not remove stale entry {:?}: {error}", path),
        }
    }

    if removed > 0 {
        info!("removed {removed} stale temp entries from {:?}", dir);
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    };

    use super::*;

    #[test]
    fn builds_filename_from_metadata() {
        let info = MediaInfo {
            id: Some("abc123".to_string()),
            title: Some("AC/DC live".to_string()),
            ..MediaInfo::default()
        };
        assert_eq!(media_filename(&info, "mp3"), "AC_DC live [abc123].mp3");
        assert_eq!(media_filename(&MediaInfo::default(), "mp4"), "video [unknown].mp4");
    }

    #[test]
    fn maps_content_types() {
        assert_eq!(content_type_for_filename("a [x].MP4"), "video/mp4");
        assert_eq!(content_type_for_filename("a.mp3"), "audio/mpeg");
        assert_eq!(content_type_for_filename("a.opus"), "audio/ogg");
        assert_eq!(content_type_for_filename("noext"), "application/octet-stream");
    }

    #[test]
    fn encodes_non_ascii_filenames() {
        let disposition = build_content_disposition("café [1].mp4");
        assert_eq!(
            disposition,
            "attachment; filename=\"caf_ [1].mp4\"; filename*=UTF-8''caf%C3%A9%20%5B1%5D.mp4"
        );
        assert_eq!(sanitize_ascii_filename("☃☃"), "__");
        assert_eq!(sanitize_ascii_filename("   "), "download.bin");
    }

    #[test]
    fn response_carries_download_headers() {
        let response = attachment_response("song [1].mp3", Body::empty(), Some(42)).unwrap();
        let headers = response.headers();
        assert_eq!(headers[CONTENT_TYPE], "audio/mpeg");
        assert_eq!(headers[CONTENT_LENGTH], "42");
        assert_eq!(headers[DOWNLOAD_FILENAME_HEADER], "song [1].mp3");
    }

    struct DropFlag(Arc<AtomicBool>);

    impl Drop for DropFlag {
        fn drop(&mut self) {
            self.0.store(true, Ordering::SeqCst);
        }
    }

    #[tokio::test]
    async fn guard_lives_until_body_is_dropped() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("clip.mp4");
        tokio::fs::write(&path, b"payload").await.unwrap();

        let dropped = Arc::new(AtomicBool::new(false));
        let body = file_body(&path, DropFlag(Arc::clone(&dropped))).await.unwrap();
        assert!(!dropped.load(Ordering::SeqCst));

        let bytes = axum::body::to_bytes(body, usize::MAX).await.unwrap();
        assert_eq!(&bytes[..], b"payload");
        assert!(dropped.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn pipe_body_stops_at_deadline() {
        let (mut writer, reader) = tokio::io::duplex(64);
        tokio::io::AsyncWriteExt::write_all(&mut writer, b"more")
            .await
            .unwrap();

        let dropped = Arc::new(AtomicBool::new(false));
        let deadline = Instant::now() + Duration::from_millis(200);
        let body = pipe_body(
            Bytes::from_static(b"head"),
            ReaderStream::new(reader),
            deadline,
            DropFlag(Arc::clone(&dropped)),
        );

        // The writer stays open, so only the deadline can end the body.
        let result = tokio::time::timeout(
            Duration::from_secs(5),
            axum::body::to_bytes(body, usize::MAX),
        )
        .await
        .unwrap();
        assert!(result.is_err());
        assert!(dropped.load(Ordering::SeqCst));
        drop(writer);
    }

    #[tokio::test]
    async fn removes_only_old_entries() {
        let dir = tempfile::tempdir().unwrap();
        tokio::fs::create_dir(dir.path().join("job")).await.unwrap();
        tokio::fs::write(dir.path().join("loose.bin"), b"x").await.unwrap();

        cleanup_stale_entries(dir.path(), Duration::from_secs(3600)).await;
        assert!(dir.path().join("job").exists());

        tokio::time::sleep(Duration::from_millis(20)).await;
        cleanup_stale_entries(dir.path(), Duration::from_millis(1)).await;
        assert!(!dir.path().join("job").exists());
        assert!(!dir.path().join("loose.bin").exists());
    }
}
