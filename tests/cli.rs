//! Binary-level smoke test: the service fails fast and clearly when its
//! required upstream LLM configuration is absent, rather than hanging or
//! panicking.

use assert_cmd::Command;

#[test]
fn missing_llm_config_exits_nonzero_with_clear_message() {
    let mut cmd = Command::cargo_bin("clinical-ingest").expect("binary should build");
    let output = cmd
        .env_clear()
        .env("PATH", std::env::var("PATH").unwrap_or_default())
        .output()
        .expect("binary should run");

    assert!(!output.status.success());
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("LLM_ENDPOINT"), "stderr was: {stderr}");
}
