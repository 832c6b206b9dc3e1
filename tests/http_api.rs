#![cfg(unix)]

use std::{
    os::unix::fs::PermissionsExt,
    path::{Path, PathBuf},
    sync::OnceLock,
    time::Duration,
};

use direct_downloader::{AppState, Config, build_router};
use serde_json::Value;
use tempfile::TempDir;
use tokio::net::TcpListener;

const FAKE_YT_DLP: &str = r#"#!/bin/sh
out=""
audio=""
ua=""
probe=0
prev=""
url=""
for arg in "$@"; do
  case "$prev" in
    -o) out="$arg" ;;
    --audio-format) audio="$arg" ;;
    --add-header)
      case "$arg" in
        User-Agent:*) ua="${arg#User-Agent:}" ;;
      esac
      ;;
  esac
  if [ "$arg" = "-J" ]; then probe=1; fi
  prev="$arg"
  url="$arg"
done

case "$url" in
  *unsupported*) echo "ERROR: Unsupported URL: $url" >&2; exit 1 ;;
  *flaky-*)
    marker="$(dirname "$0")/$(basename "$url")"
    if [ ! -e "$marker" ]; then
      : > "$marker"
      echo "ERROR: unable to download video data: HTTP Error 403: Forbidden" >&2
      exit 1
    fi
    ;;
esac

if [ "$probe" = 1 ]; then
  printf '{"id":"abc123","title":"Test Clip","ext":"mp4","duration":3.5,"uploader":"%s"}' "$ua"
  exit 0
fi

if [ "$out" = "-" ]; then
  case "$url" in
    *stall*) printf 'FIRST'; exec sleep 30 ;;
  esac
  printf 'PIPEDBYTES'
  exit 0
fi

case "$url" in
  *oversize*) exit 0 ;;
esac

ext="${audio:-mp4}"
file="$(dirname "$out")/Test Clip [abc123].$ext"
printf 'FILEBYTES' > "$file"
printf '%s\n' "$file"
"#;

const FAKE_FFMPEG: &str = "#!/bin/sh\nprintf 'AUDIO:'\nexec cat\n";

struct FakeBinaries {
    _dir: TempDir,
    yt_dlp: PathBuf,
    ffmpeg: PathBuf,
}

fn write_script(dir: &Path, name: &str, contents: &str) -> PathBuf {
    let path = dir.join(name);
    std::fs::write(&path, contents).unwrap();
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
    path
}

/// Written once, before any test spawns a process, so no child inherits an
/// open write handle to them.
fn fake_binaries() -> &'static FakeBinaries {
    static BINARIES: OnceLock<FakeBinaries> = OnceLock::new();
    BINARIES.get_or_init(|| {
        let dir = tempfile::tempdir().unwrap();
        let yt_dlp = write_script(dir.path(), "yt-dlp", FAKE_YT_DLP);
        let ffmpeg = write_script(dir.path(), "ffmpeg", FAKE_FFMPEG);
        FakeBinaries {
            _dir: dir,
            yt_dlp,
            ffmpeg,
        }
    })
}

struct TestServer {
    base_url: String,
    work_dir: TempDir,
    _static_dir: TempDir,
}

impl TestServer {
    async fn start() -> Self {
        Self::start_with(|_| {}).await
    }

    async fn start_with(configure: impl FnOnce(&mut Config)) -> Self {
        let work_dir = tempfile::tempdir().unwrap();
        let static_dir = tempfile::tempdir().unwrap();
        std::fs::write(static_dir.path().join("index.html"), "<h1>downloader</h1>").unwrap();

        let binaries = fake_binaries();
        let mut config = Config {
            yt_dlp_bin: binaries.yt_dlp.clone(),
            ffmpeg_bin: binaries.ffmpeg.clone(),
            work_dir: work_dir.path().to_path_buf(),
            static_dir: static_dir.path().to_path_buf(),
            yt_dlp_timeout: Duration::from_secs(10),
            retry_backoff: Duration::ZERO,
            ..Config::default()
        };
        configure(&mut config);

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let app = build_router(AppState::from_config(&config), &config);
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        Self {
            base_url: format!("http://{addr}"),
            work_dir,
            _static_dir: static_dir,
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.base_url)
    }

    fn work_dir_entries(&self) -> usize {
        std::fs::read_dir(self.work_dir.path()).unwrap().count()
    }

    async fn wait_for_empty_work_dir(&self) -> bool {
        for _ in 0..50 {
            if self.work_dir_entries() == 0 {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        false
    }
}

#[tokio::test]
async fn health_reports_ok() {
    let server = TestServer::start().await;
    let body: Value = reqwest::get(server.url("/api/health"))
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(body["status"], "ok");
}

#[tokio::test]
async fn serves_index_page() {
    let server = TestServer::start().await;
    let response = reqwest::get(server.url("/")).await.unwrap();
    assert_eq!(response.status(), 200);
    assert!(response.text().await.unwrap().contains("downloader"));
}

#[tokio::test]
async fn missing_url_is_rejected() {
    let server = TestServer::start().await;
    let response = reqwest::get(server.url("/api/direct-download")).await.unwrap();
    assert_eq!(response.status(), 400);

    let body: Value = response.json().await.unwrap();
    assert_eq!(body["ok"], false);
    assert_eq!(body["error"], "URL required");
}

#[tokio::test]
async fn direct_download_sends_file_and_cleans_up() {
    let server = TestServer::start().await;
    let response = reqwest::Client::new()
        .post(server.url("/api/direct-download"))
        .body(r#"{"url":"https://example.com/watch?v=abc123","quality":"720p"}"#)
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), 200);
    let headers = response.headers().clone();
    assert_eq!(headers["content-type"], "video/mp4");
    assert_eq!(headers["content-length"], "9");
    assert_eq!(headers["x-download-filename"], "Test Clip [abc123].mp4");
    assert!(
        headers["content-disposition"]
            .to_str()
            .unwrap()
            .starts_with("attachment; filename=\"Test Clip [abc123].mp4\"")
    );

    assert_eq!(&response.bytes().await.unwrap()[..], b"FILEBYTES");
    assert!(server.wait_for_empty_work_dir().await);
}

#[tokio::test]
async fn audio_download_uses_requested_codec() {
    let server = TestServer::start().await;
    let response = reqwest::get(server.url(
        "/api/direct-download?url=https%3A%2F%2Fexample.com%2Fv&outputType=mp3&mp3Bitrate=128",
    ))
    .await
    .unwrap();

    assert_eq!(response.status(), 200);
    assert_eq!(response.headers()["content-type"], "audio/mpeg");
    assert_eq!(
        response.headers()["x-download-filename"],
        "Test Clip [abc123].mp3"
    );
}

#[tokio::test]
async fn stream_mode_pipes_stdout() {
    let server = TestServer::start().await;
    let response = reqwest::get(server.url(
        "/api/direct-download?url=https%3A%2F%2Fexample.com%2Fv&stream=true",
    ))
    .await
    .unwrap();

    assert_eq!(response.status(), 200);
    assert_eq!(
        response.headers()["x-download-filename"],
        "Test Clip [abc123].mp4"
    );
    assert!(response.headers().get("content-length").is_none());
    assert_eq!(&response.bytes().await.unwrap()[..], b"PIPEDBYTES");
    assert_eq!(server.work_dir_entries(), 0);
}

#[tokio::test]
async fn extractor_failure_becomes_json_error() {
    let server = TestServer::start().await;
    let response = reqwest::get(server.url(
        "/api/direct-download?url=https%3A%2F%2Fexample.com%2Funsupported",
    ))
    .await
    .unwrap();

    assert_eq!(response.status(), 400);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["error"], "Unsupported or invalid URL for download.");
    assert!(server.wait_for_empty_work_dir().await);
}

#[tokio::test]
async fn info_returns_metadata_and_filename() {
    let server = TestServer::start().await;
    let body: Value = reqwest::Client::new()
        .post(server.url("/api/info"))
        .json(&serde_json::json!({"url": "https://example.com/v", "outputType": "opus"}))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();

    assert_eq!(body["ok"], true);
    assert_eq!(body["info"]["title"], "Test Clip");
    assert_eq!(body["filename"], "Test Clip [abc123].opus");
}

#[tokio::test]
async fn background_job_lifecycle() {
    let server = TestServer::start().await;
    let client = reqwest::Client::new();

    let response = client
        .post(server.url("/api/jobs"))
        .json(&serde_json::json!({"url": "https://example.com/v"}))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 202);
    let created: Value = response.json().await.unwrap();
    let job_id = created["jobId"].as_str().unwrap().to_string();

    let mut status = Value::Null;
    for _ in 0..100 {
        status = client
            .get(server.url(&format!("/api/jobs/{job_id}")))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        if status["status"] == "completed" {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert_eq!(status["status"], "completed");
    assert_eq!(status["filename"], "Test Clip [abc123].mp4");
    assert_eq!(status["size"], 9);

    let file = client
        .get(server.url(&format!("/api/jobs/{job_id}/file")))
        .send()
        .await
        .unwrap();
    assert_eq!(file.status(), 200);
    assert_eq!(&file.bytes().await.unwrap()[..], b"FILEBYTES");

    let deleted = client
        .delete(server.url(&format!("/api/jobs/{job_id}")))
        .send()
        .await
        .unwrap();
    assert_eq!(deleted.status(), 200);
    assert!(server.wait_for_empty_work_dir().await);

    let missing = client
        .get(server.url(&format!("/api/jobs/{job_id}")))
        .send()
        .await
        .unwrap();
    assert_eq!(missing.status(), 404);
}

#[tokio::test]
async fn unknown_job_is_not_found() {
    let server = TestServer::start().await;
    let response = reqwest::get(server.url("/api/jobs/not-a-job/file")).await.unwrap();
    assert_eq!(response.status(), 404);
}

#[tokio::test]
async fn audio_stream_goes_through_transcoder() {
    let server = TestServer::start().await;
    let response = reqwest::get(server.url(
        "/api/direct-download?url=https%3A%2F%2Fexample.com%2Fv&outputType=mp3&stream=true",
    ))
    .await
    .unwrap();

    assert_eq!(response.status(), 200);
    assert_eq!(response.headers()["content-type"], "audio/mpeg");
    assert_eq!(
        response.headers()["x-download-filename"],
        "Test Clip [abc123].mp3"
    );
    assert_eq!(&response.bytes().await.unwrap()[..], b"AUDIO:PIPEDBYTES");
}

#[tokio::test]
async fn stalled_stream_is_cut_off_at_timeout() {
    let server = TestServer::start_with(|config| {
        config.yt_dlp_timeout = Duration::from_secs(1);
    })
    .await;
    let response = reqwest::get(server.url(
        "/api/direct-download?url=https%3A%2F%2Fexample.com%2Fstall&stream=true",
    ))
    .await
    .unwrap();
    assert_eq!(response.status(), 200);

    let finished = tokio::time::timeout(Duration::from_secs(10), response.bytes()).await;
    assert!(matches!(finished, Ok(Err(_))));
}

#[tokio::test]
async fn transient_failure_retries_with_fallback_user_agent() {
    let server = TestServer::start().await;
    let url = format!("https://example.com/flaky-{}", uuid::Uuid::new_v4());
    let response = reqwest::Client::new()
        .post(server.url("/api/info"))
        .json(&serde_json::json!({ "url": url }))
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), 200);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["ok"], true);
    assert!(
        body["info"]["uploader"]
            .as_str()
            .unwrap()
            .starts_with("Mozilla/5.0")
    );
}

#[tokio::test]
async fn size_capped_download_is_rejected() {
    let server = TestServer::start_with(|config| {
        config.max_download_bytes = Some(10);
    })
    .await;
    let response = reqwest::get(server.url(
        "/api/direct-download?url=https%3A%2F%2Fexample.com%2Foversize",
    ))
    .await
    .unwrap();

    assert_eq!(response.status(), 400);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["code"], "EXTRACTION_FAILED");
    assert_eq!(body["error"], "the file exceeds the 10 bytes download limit");
    assert!(server.wait_for_empty_work_dir().await);
}

#[tokio::test]
async fn undecodable_query_gets_json_error() {
    let server = TestServer::start().await;
    let response = reqwest::get(server.url("/api/direct-download?url=a&url=b"))
        .await
        .unwrap();

    assert_eq!(response.status(), 400);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["ok"], false);
}
