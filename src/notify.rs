//! Notification delivery: stdout, email via sendmail, and hook
//! scripts.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Mutex;

use anyhow::{anyhow, bail, Context, Result};
use rand::RngCore;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

/// Serializes stdout writes so notification bodies and JSON lines
/// never interleave across tasks.
static STDOUT_LOCK: Mutex<()> = Mutex::new(());

const SENDMAIL_PATHS: &[&str] = &["/usr/sbin/sendmail", "/usr/lib/sendmail", "sendmail"];

/// One event to deliver: a matched certificate, a malformed entry, a
/// health check failure, or an error.
#[derive(Debug, Clone)]
pub struct Notification {
    /// Event name, also exported as `EVENT` to hook scripts.
    pub event: &'static str,
    /// One-line summary (email subject).
    pub summary: String,
    /// Multi-line human-readable body.
    pub text: String,
    /// Environment variables for hook scripts.
    pub environ: Vec<(String, String)>,
    /// Structured form for `--json` output.
    pub json: serde_json::Value,
}

/// The configured notification methods. Every method receives every
/// notification; failures are reported to the caller.
#[derive(Debug, Clone, Default)]
pub struct Notifier {
    pub stdout: bool,
    pub json: bool,
    pub email: Vec<String>,
    pub script: Option<PathBuf>,
    pub script_dir: Option<PathBuf>,
}

impl Notifier {
    /// Whether at least one method is configured.
    pub fn any_configured(&self) -> bool {
        self.stdout
            || self.json
            || !self.email.is_empty()
            || self.script.is_some()
            || self.script_dir.is_some()
    }

    pub async fn notify(&self, notification: &Notification) -> Result<()> {
        if self.json {
            self.write_json_to_stdout(notification);
        } else if self.stdout {
            self.write_to_stdout(notification);
        }

        if !self.email.is_empty() {
            self.send_email(notification).await?;
        }

        if let Some(script) = &self.script {
            exec_script(script, notification).await?;
        }

        if let Some(dir) = &self.script_dir {
            exec_script_dir(dir, notification).await?;
        }

        Ok(())
    }

    fn write_to_stdout(&self, notification: &Notification) {
        let _lock = STDOUT_LOCK.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        println!("{}\n", notification.text.trim_end());
    }

    fn write_json_to_stdout(&self, notification: &Notification) {
        let mut line = notification.json.clone();
        if let Some(object) = line.as_object_mut() {
            object.insert("event".to_string(), notification.event.into());
            object.insert("summary".to_string(), notification.summary.clone().into());
        }
        let _lock = STDOUT_LOCK.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        println!("{line}");
    }

    async fn send_email(&self, notification: &Notification) -> Result<()> {
        let from = std::env::var("EMAIL").ok().filter(|v| !v.is_empty());

        let mut body = String::new();
        if let Some(from) = &from {
            body.push_str(&format!("From: {from}\n"));
        }
        body.push_str(&format!("To: {}\n", self.email.join(", ")));
        body.push_str(&format!("Subject: [certwatch] {}\n", notification.summary));
        body.push_str(&format!("Date: {}\n", chrono::Utc::now().to_rfc2822()));
        body.push_str(&format!("Message-ID: <{}>\n", generate_message_id()));
        body.push_str("Mime-Version: 1.0\n");
        body.push_str("Content-Type: text/plain; charset=UTF-8\n");
        body.push_str("X-Mailer: certwatch\n");
        body.push('\n');
        body.push_str(&notification.text);

        let mut args: Vec<String> = vec!["-i".to_string()];
        if let Some(from) = &from {
            args.push("-f".to_string());
            args.push(from.clone());
        }
        args.push("--".to_string());
        args.extend(self.email.iter().cloned());

        let mut child = Command::new(sendmail_path())
            .args(&args)
            .stdin(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .context("spawning sendmail")?;

        let mut stdin = child
            .stdin
            .take()
            .ok_or_else(|| anyhow!("sendmail stdin unavailable"))?;
        stdin.write_all(body.as_bytes()).await?;
        drop(stdin);

        let output = child.wait_with_output().await?;
        if !output.status.success() {
            bail!(
                "error sending email to {:?}: sendmail exited with {} and error {:?}",
                self.email,
                output.status,
                String::from_utf8_lossy(&output.stderr).trim(),
            );
        }
        Ok(())
    }
}

fn sendmail_path() -> &'static str {
    for path in SENDMAIL_PATHS.iter().copied() {
        if Path::new(path).is_absolute() && Path::new(path).exists() {
            return path;
        }
    }
    SENDMAIL_PATHS[SENDMAIL_PATHS.len() - 1]
}

fn generate_message_id() -> String {
    let mut bytes = [0u8; 16];
    rand::thread_rng().fill_bytes(&mut bytes);
    let hex: String = bytes.iter().map(|b| format!("{b:02x}")).collect();
    let host = std::env::var("HOSTNAME").unwrap_or_else(|_| "localhost".to_string());
    format!("{hex}@{host}")
}

async fn exec_script(script: &Path, notification: &Notification) -> Result<()> {
    let mut command = Command::new(script);
    command.env("EVENT", notification.event);
    command.env("SUMMARY", &notification.summary);
    for (key, value) in &notification.environ {
        command.env(key, value);
    }

    let output = command
        .stdin(Stdio::null())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .output()
        .await
        .with_context(|| format!("executing script {}", script.display()))?;

    if !output.status.success() {
        bail!(
            "script {} exited with {} and error {:?}",
            script.display(),
            output.status,
            String::from_utf8_lossy(&output.stderr).trim(),
        );
    }
    Ok(())
}

/// Runs every executable in `dir`, skipping dotfiles, the way cron
/// treats a drop-in directory.
async fn exec_script_dir(dir: &Path, notification: &Notification) -> Result<()> {
    let mut entries = match tokio::fs::read_dir(dir).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
        Err(e) => {
            return Err(e).with_context(|| format!("reading script directory {}", dir.display()))
        }
    };

    while let Some(entry) = entries.next_entry().await? {
        let name = entry.file_name();
        if name.to_string_lossy().starts_with('.') {
            continue;
        }
        let path = entry.path();
        let metadata = match tokio::fs::metadata(&path).await {
            Ok(metadata) => metadata,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
            Err(e) => return Err(e.into()),
        };
        if metadata.is_file() && is_executable(&metadata) {
            exec_script(&path, notification).await?;
        }
    }
    Ok(())
}

#[cfg(unix)]
fn is_executable(metadata: &std::fs::Metadata) -> bool {
    use std::os::unix::fs::PermissionsExt;
    metadata.permissions().mode() & 0o111 != 0
}

#[cfg(not(unix))]
fn is_executable(_metadata: &std::fs::Metadata) -> bool {
    true
}
