//! Spawns the conductor binary against a temporary data directory.

use std::net::TcpListener;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Output, Stdio};
use std::time::Duration;

fn conductor_bin() -> PathBuf {
    std::env::var("CARGO_BIN_EXE_conductor")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("target/debug/conductor"))
}

fn run(data_dir: &Path, args: &[&str], extra_env: &[(&str, &str)]) -> Output {
    let mut cmd = Command::new(conductor_bin());
    cmd.args(args)
        .env("CONDUCTOR_DATA_DIR", data_dir)
        .env("CONDUCTOR_MASTER_KEY", "integration-master-key")
        .env_remove("CONDUCTOR_PREVIOUS_MASTER_KEY")
        .env_remove("CONDUCTOR_NEW_MASTER_KEY");
    for (k, v) in extra_env {
        cmd.env(k, v);
    }
    cmd.output().expect("conductor binary runs")
}

fn combined(output: &Output) -> String {
    format!(
        "{}{}",
        String::from_utf8_lossy(&output.stdout),
        String::from_utf8_lossy(&output.stderr)
    )
}

fn find_free_port() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").expect("bind ephemeral port");
    listener.local_addr().expect("local addr").port()
}

struct ServerGuard(Child);

impl Drop for ServerGuard {
    fn drop(&mut self) {
        let _ = self.0.kill();
        let _ = self.0.wait();
    }
}

#[test]
fn help_lists_every_command() {
    let tmp = tempfile::tempdir().unwrap();
    let output = run(tmp.path(), &["help"], &[]);
    assert!(output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    for command in ["serve", "sweep", "rotate-keys", "--api-port"] {
        assert!(stdout.contains(command), "help is missing {}", command);
    }
}

#[test]
fn unknown_command_fails() {
    let tmp = tempfile::tempdir().unwrap();
    let output = run(tmp.path(), &["launch-rockets"], &[]);
    assert!(!output.status.success());
    assert!(combined(&output).contains("Unknown command: launch-rockets"));
}

#[test]
fn sweep_removes_stale_execution_directories() {
    let tmp = tempfile::tempdir().unwrap();
    let orphan = tmp.path().join("executions").join("exec-crashed");
    std::fs::create_dir_all(orphan.join(".config")).unwrap();
    std::fs::write(orphan.join("tools.json"), b"{\"secret\":\"tok_abc123\"}").unwrap();
    let unrelated = tmp.path().join("executions").join("keep-me");
    std::fs::create_dir_all(&unrelated).unwrap();

    let output = run(tmp.path(), &["sweep", "--max-age-secs", "0"], &[]);
    assert!(output.status.success(), "{}", combined(&output));
    assert!(combined(&output).contains("Swept 1"));
    assert!(!orphan.exists());
    assert!(unrelated.exists());
}

#[test]
fn rotate_keys_requires_the_new_key() {
    let tmp = tempfile::tempdir().unwrap();
    let output = run(tmp.path(), &["rotate-keys"], &[]);
    assert!(!output.status.success());
    assert!(combined(&output).contains("CONDUCTOR_NEW_MASTER_KEY"));

    let output = run(
        tmp.path(),
        &["rotate-keys"],
        &[("CONDUCTOR_NEW_MASTER_KEY", "next-master-key")],
    );
    assert!(output.status.success(), "{}", combined(&output));
    assert!(combined(&output).contains("Re-encrypted 0 credentials"));
}

#[cfg(unix)]
#[tokio::test]
async fn serve_runs_submitted_tasks() {
    let tmp = tempfile::tempdir().unwrap();
    std::fs::write(
        tmp.path().join("conductor.toml"),
        r#"
[execution]
program = "sh"
args = ["-c", "task=$(cat); echo \"echo: $task\""]
timeout_secs = 30

[[accounts]]
id = "acct-1"
organization_id = "acme"

[[agents]]
id = "lead"
organization_id = "acme"
permission_level = "manager"
"#,
    )
    .unwrap();

    let port = find_free_port();
    let child = Command::new(conductor_bin())
        .args(["serve", "--api-host", "127.0.0.1", "--api-port", &port.to_string()])
        .env("CONDUCTOR_DATA_DIR", tmp.path())
        .env("CONDUCTOR_MASTER_KEY", "integration-master-key")
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .spawn()
        .expect("spawn conductor serve");
    let _guard = ServerGuard(child);

    let base = format!("http://127.0.0.1:{}/api", port);
    let client = reqwest::Client::new();

    let mut ready = false;
    for _ in 0..100 {
        if let Ok(resp) = client
            .get(format!("{}/organizations/acme/pool", base))
            .send()
            .await
            && resp.status().is_success()
        {
            ready = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    assert!(ready, "server never became ready");

    let submitted: serde_json::Value = client
        .post(format!("{}/agents/lead/executions", base))
        .json(&serde_json::json!({ "task": "ping" }))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    let id = submitted["execution_id"].as_str().unwrap().to_string();

    let mut execution = serde_json::Value::Null;
    for _ in 0..100 {
        let body: serde_json::Value = client
            .get(format!("{}/executions/{}", base, id))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        execution = body["execution"].clone();
        if execution["status"] == "completed" || execution["status"] == "failed" {
            break;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    assert_eq!(execution["status"], "completed", "{}", execution);
    assert_eq!(execution["output"], "echo: ping");
    assert!(tmp.path().join("conductor.db").exists());
}
