//! Classifier backed by an external executable, the deployment shape the
//! visual model actually ships in: image bytes go to the child's stdin, one
//! JSON object `{room_type, confidence, style_tags}` comes back on stdout.

use std::io::Write;
use std::path::PathBuf;
use std::process::{Command, Stdio};

use anyhow::{bail, Context};
use roomfeed_core::Classification;

use crate::Classifier;

#[derive(Debug, Clone)]
pub struct CommandClassifier {
    name: String,
    program: PathBuf,
    args: Vec<String>,
}

impl CommandClassifier {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        let program = program.into();
        let name = program
            .file_stem()
            .and_then(|stem| stem.to_str())
            .unwrap_or("external-command")
            .to_string();
        Self {
            name,
            program,
            args: Vec::new(),
        }
    }

    pub fn with_args(mut self, args: impl IntoIterator<Item = String>) -> Self {
        self.args = args.into_iter().collect();
        self
    }
}

impl Classifier for CommandClassifier {
    fn name(&self) -> &str {
        &self.name
    }

    fn classify(&self, image_bytes: &[u8]) -> anyhow::Result<Classification> {
        let mut child = Command::new(&self.program)
            .args(&self.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .spawn()
            .with_context(|| format!("spawning classifier {}", self.program.display()))?;

        {
            let mut stdin = child.stdin.take().context("classifier stdin unavailable")?;
            stdin
                .write_all(image_bytes)
                .context("writing image bytes to classifier")?;
        }

        let output = child.wait_with_output().context("waiting for classifier")?;
        if !output.status.success() {
            bail!(
                "classifier {} exited with {}",
                self.program.display(),
                output.status
            );
        }
        serde_json::from_slice(&output.stdout)
            .with_context(|| format!("parsing output of classifier {}", self.program.display()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use roomfeed_core::RoomType;

    #[cfg(unix)]
    #[test]
    fn runs_the_command_and_parses_its_output() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let script = dir.path().join("classify.sh");
        std::fs::write(
            &script,
            "#!/bin/sh\ncat > /dev/null\necho '{\"room_type\":\"kitchen\",\"confidence\":0.92,\"style_tags\":[\"modern\"]}'\n",
        )
        .unwrap();
        std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();

        let classifier = CommandClassifier::new(&script);
        assert_eq!(classifier.name(), "classify");

        let result = classifier.classify(b"image bytes").unwrap();
        assert_eq!(result.room_type, RoomType::Kitchen);
        assert_eq!(result.style_tags, vec!["modern".to_string()]);
    }

    #[cfg(unix)]
    #[test]
    fn nonzero_exit_is_an_error() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let script = dir.path().join("broken.sh");
        std::fs::write(&script, "#!/bin/sh\ncat > /dev/null\nexit 3\n").unwrap();
        std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();

        let classifier = CommandClassifier::new(&script);
        let err = classifier.classify(b"image bytes").unwrap_err();
        assert!(err.to_string().contains("exited"));
    }

    #[test]
    fn missing_program_is_an_error() {
        let classifier = CommandClassifier::new("/nonexistent/visual-model");
        assert!(classifier.classify(b"image bytes").is_err());
    }
}
