//! Integration tests for Kiln

mod cli_tests {
    use assert_cmd::{cargo::cargo_bin_cmd, Command};
    use predicates::prelude::*;

    fn kiln() -> Command {
        cargo_bin_cmd!("kiln")
    }

    #[test]
    fn help_displays() {
        kiln()
            .arg("--help")
            .assert()
            .success()
            .stdout(predicate::str::contains("CI build-cache orchestrator"));
    }

    #[test]
    fn version_displays() {
        kiln()
            .arg("--version")
            .assert()
            .success()
            .stdout(predicate::str::contains("kiln"));
    }

    #[test]
    fn config_path() {
        kiln()
            .args(["config", "path"])
            .assert()
            .success()
            .stdout(predicate::str::contains("config.toml"));
    }

    #[test]
    fn config_show_defaults() {
        let dir = tempfile::tempdir().unwrap();
        kiln()
            .current_dir(dir.path())
            .args(["config", "show"])
            .assert()
            .success()
            .stdout(predicate::str::contains("[cache]"))
            .stdout(predicate::str::contains("backend = \"registry\""));
    }

    #[test]
    fn restore_without_workspace_fails() {
        let dir = tempfile::tempdir().unwrap();
        kiln()
            .current_dir(dir.path())
            .env_remove("CASCACHE_DEFAULT_WORKSPACE")
            .args([
                "restore",
                "--state-file",
                dir.path().join("state.json").to_str().unwrap(),
            ])
            .assert()
            .failure()
            .stderr(predicate::str::contains("Workspace is required"));
    }

    #[test]
    fn build_requires_image() {
        kiln()
            .arg("build")
            .assert()
            .failure()
            .stderr(predicate::str::contains("--image"));
    }

    #[test]
    fn save_without_state_is_quiet_success() {
        let dir = tempfile::tempdir().unwrap();
        kiln()
            .current_dir(dir.path())
            .env_remove("CASCACHE_DEFAULT_WORKSPACE")
            .env_remove("CASCACHE_TOKEN")
            .args([
                "save",
                "--state-file",
                dir.path().join("state.json").to_str().unwrap(),
            ])
            .assert()
            .success();
    }

    #[test]
    fn local_config_overrides_defaults() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("kiln.toml"),
            "[cache]\nbackend = \"local\"\nport = 5010\n",
        )
        .unwrap();

        kiln()
            .current_dir(dir.path())
            .args(["config", "show"])
            .assert()
            .success()
            .stdout(predicate::str::contains("backend = \"local\""))
            .stdout(predicate::str::contains("port = 5010"));
    }
}
