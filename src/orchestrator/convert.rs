//! Post-download conversion through an external command.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use thiserror::Error;
use tokio::process::Command;
use tracing::{debug, info};

use crate::config::ConvertConfig;

/// Longest stderr excerpt carried in an error
const STDERR_TAIL: usize = 400;

#[derive(Debug, Error)]
pub enum ConvertError {
  #[error("could not start `{command}`: {source}")]
  Spawn {
    command: String,
    #[source]
    source: std::io::Error,
  },
  #[error("converter timed out after {0:?}")]
  Timeout(Duration),
  #[error("converter exited with {status}: {stderr}")]
  Failed { status: String, stderr: String },
  #[error("converter produced no output at {0}")]
  MissingOutput(PathBuf),
}

#[derive(Debug, Clone)]
pub struct Converter {
  command: String,
  args: Vec<String>,
  output_format: String,
  timeout: Duration,
}

impl Converter {
  pub fn new(command: impl Into<String>, args: Vec<String>, output_format: &str, timeout: Duration) -> Self {
    Self {
      command: command.into(),
      args,
      output_format: output_format.trim_start_matches('.').to_ascii_lowercase(),
      timeout,
    }
  }

  pub fn from_config(config: &ConvertConfig) -> Self {
    Self::new(
      config.command.clone(),
      config.args.clone(),
      &config.output_format,
      config.timeout(),
    )
  }

  /// Artifacts already in the output format are left alone.
  pub fn applies_to(&self, format: &str) -> bool {
    !format.trim_start_matches('.').eq_ignore_ascii_case(&self.output_format)
  }

  pub fn output_for(&self, input: &Path) -> PathBuf {
    input.with_extension(&self.output_format)
  }

  /// Convert `input` and return the path of the written file.
  pub async fn convert(&self, input: &Path) -> Result<PathBuf, ConvertError> {
    let output = self.output_for(input);
    let args: Vec<String> = self
      .args
      .iter()
      .map(|a| {
        a.replace("{input}", &input.to_string_lossy())
          .replace("{output}", &output.to_string_lossy())
      })
      .collect();

    // A stale result from an earlier attempt must not pass for this one
    if let Err(e) = tokio::fs::remove_file(&output).await {
      if e.kind() != std::io::ErrorKind::NotFound {
        debug!(file = %output.display(), error = %e, "could not remove previous conversion");
      }
    }

    debug!(command = %self.command, ?args, "running converter");
    let child = Command::new(&self.command)
      .args(&args)
      .stdin(Stdio::null())
      .stdout(Stdio::null())
      .stderr(Stdio::piped())
      .kill_on_drop(true)
      .spawn()
      .map_err(|source| ConvertError::Spawn {
        command: self.command.clone(),
        source,
      })?;

    let result = tokio::time::timeout(self.timeout, child.wait_with_output())
      .await
      .map_err(|_| ConvertError::Timeout(self.timeout))?
      .map_err(|source| ConvertError::Spawn {
        command: self.command.clone(),
        source,
      })?;

    if !result.status.success() {
      return Err(ConvertError::Failed {
        status: result.status.to_string(),
        stderr: stderr_tail(&result.stderr),
      });
    }

    match tokio::fs::metadata(&output).await {
      Ok(meta) if meta.len() > 0 => {
        info!(from = %input.display(), to = %output.display(), size = meta.len(), "artifact converted");
        Ok(output)
      }
      _ => Err(ConvertError::MissingOutput(output)),
    }
  }
}

fn stderr_tail(stderr: &[u8]) -> String {
  let text = String::from_utf8_lossy(stderr);
  let text = text.trim();
  let start = text
    .char_indices()
    .rev()
    .nth(STDERR_TAIL)
    .map(|(i, _)| i)
    .unwrap_or(0);
  text[start..].to_string()
}

#[cfg(all(test, unix))]
mod tests {
  use super::*;
  use tempfile::TempDir;

  fn shell(script: &str, timeout: Duration) -> Converter {
    Converter::new(
      "sh",
      vec![
        "-c".to_string(),
        script.to_string(),
        "convert".to_string(),
        "{input}".to_string(),
        "{output}".to_string(),
      ],
      "glb",
      timeout,
    )
  }

  #[test]
  fn test_applies_only_to_other_formats() {
    let converter = shell("true", Duration::from_secs(1));
    assert!(converter.applies_to("usdz"));
    assert!(!converter.applies_to("GLB"));
    assert!(!converter.applies_to(".glb"));
    assert_eq!(
      converter.output_for(Path::new("/out/Chair_a1_1.usdz")),
      PathBuf::from("/out/Chair_a1_1.glb")
    );
  }

  #[tokio::test]
  async fn test_successful_conversion_writes_output() {
    let dir = TempDir::new().unwrap();
    let input = dir.path().join("Chair_a1_1.usdz");
    std::fs::write(&input, b"usdz bytes").unwrap();

    let converter = shell(r#"cp "$1" "$2""#, Duration::from_secs(5));
    let output = converter.convert(&input).await.unwrap();

    assert_eq!(output, dir.path().join("Chair_a1_1.glb"));
    assert_eq!(std::fs::read(&output).unwrap(), b"usdz bytes");
    assert!(input.exists());
  }

  #[tokio::test]
  async fn test_nonzero_exit_is_reported_with_stderr() {
    let dir = TempDir::new().unwrap();
    let input = dir.path().join("a.usdz");
    std::fs::write(&input, b"x").unwrap();

    let converter = shell("echo 'bad mesh' >&2; exit 3", Duration::from_secs(5));
    let err = converter.convert(&input).await.unwrap_err();

    assert!(matches!(err, ConvertError::Failed { ref stderr, .. } if stderr == "bad mesh"));
  }

  #[tokio::test]
  async fn test_missing_output_is_a_failure() {
    let dir = TempDir::new().unwrap();
    let input = dir.path().join("a.usdz");
    std::fs::write(&input, b"x").unwrap();
    // Left over from an earlier attempt
    std::fs::write(dir.path().join("a.glb"), b"old").unwrap();

    let err = shell("true", Duration::from_secs(5)).convert(&input).await.unwrap_err();
    assert!(matches!(err, ConvertError::MissingOutput(_)));
  }

  #[tokio::test]
  async fn test_slow_converter_times_out() {
    let dir = TempDir::new().unwrap();
    let input = dir.path().join("a.usdz");
    std::fs::write(&input, b"x").unwrap();

    let err = shell("sleep 5", Duration::from_millis(100))
      .convert(&input)
      .await
      .unwrap_err();
    assert!(matches!(err, ConvertError::Timeout(_)));
  }

  #[tokio::test]
  async fn test_unknown_command_fails_to_spawn() {
    let dir = TempDir::new().unwrap();
    let converter = Converter::new("harvester-no-such-converter", Vec::new(), "glb", Duration::from_secs(1));
    let err = converter.convert(&dir.path().join("a.usdz")).await.unwrap_err();
    assert!(matches!(err, ConvertError::Spawn { .. }));
  }
}
