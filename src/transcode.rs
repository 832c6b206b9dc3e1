use std::{path::Path, process::Stdio};

use tokio::process::{ChildStdout, Command};
use tracing::debug;

use crate::{
    extractor::{ExtractorError, PipedProcess},
    options::OutputType,
};

/// Muxer and encoder ffmpeg needs to write an audio format to a pipe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AudioPipeFormat {
    pub muxer: &'static str,
    pub codec: &'static str,
    pub movflags: Option<&'static str>,
}

impl AudioPipeFormat {
    pub fn for_output(output: OutputType) -> Option<Self> {
        match output {
            OutputType::Mp3 => Some(Self {
                muxer: "mp3",
                codec: "libmp3lame",
                movflags: None,
            }),
            // Plain mp4 needs a seekable output; fragmented mp4 does not.
            OutputType::M4a => Some(Self {
                muxer: "ipod",
                codec: "aac",
                movflags: Some("frag_keyframe+empty_moov"),
            }),
            OutputType::Opus => Some(Self {
                muxer: "ogg",
                codec: "libopus",
                movflags: None,
            }),
            OutputType::Mp4 | OutputType::Webm | OutputType::Mkv => None,
        }
    }
}

pub fn ffmpeg_pipe_args(format: AudioPipeFormat, bitrate_kbps: u32) -> Vec<String> {
    let mut args = vec![
        "-hide_banner".to_string(),
        "-loglevel".to_string(),
        "error".to_string(),
        "-i".to_string(),
        "pipe:0".to_string(),
        "-vn".to_string(),
        "-c:a".to_string(),
        format.codec.to_string(),
        "-b:a".to_string(),
        format!("{bitrate_kbps}k"),
    ];

    if let Some(movflags) = format.movflags {
        args.push("-movflags".to_string());
        args.push(movflags.to_string());
    }

    args.extend(["-f".to_string(), format.muxer.to_string(), "pipe:1".to_string()]);
    args
}

/// Feeds `source` into ffmpeg's stdin and returns ffmpeg with its stdout.
pub fn spawn_transcoder(
    ffmpeg: &Path,
    source: ChildStdout,
    format: AudioPipeFormat,
    bitrate_kbps: u32,
) -> Result<(PipedProcess, ChildStdout), ExtractorError> {
    let stdin: Stdio = source.try_into()?;
    let args = ffmpeg_pipe_args(format, bitrate_kbps);

    debug!("spawning {} {:?}", ffmpeg.display(), args);
    let mut command = Command::new(ffmpeg);
    command.args(args).stdin(stdin);
    PipedProcess::spawn(command, ffmpeg)
}
