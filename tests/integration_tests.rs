//! Integration tests for the atelier CLI
//!
//! These tests exercise the binary end to end: database setup, account
//! creation, and the argument surface of the server command.

use assert_cmd::Command;
use assert_cmd::cargo::cargo_bin_cmd;
use predicates::prelude::*;
use std::path::PathBuf;
use tempfile::TempDir;

/// Helper to create an atelier Command
fn atelier() -> Command {
    cargo_bin_cmd!("atelier")
}

/// Helper to create a temporary data directory
fn create_temp_dir() -> TempDir {
    TempDir::new().unwrap()
}

/// Database path inside a temp directory
fn db_path(dir: &TempDir) -> PathBuf {
    dir.path().join("atelier.db")
}

/// Helper to initialize a database in a temp directory
fn init_db(dir: &TempDir) {
    atelier()
        .arg("init-db")
        .arg("--db")
        .arg(db_path(dir))
        .assert()
        .success();
}

// =============================================================================
// Basic CLI Tests
// =============================================================================

mod cli_basics {
    use super::*;

    #[test]
    fn test_atelier_help() {
        atelier()
            .arg("--help")
            .assert()
            .success()
            .stdout(predicate::str::contains("serve"))
            .stdout(predicate::str::contains("init-db"))
            .stdout(predicate::str::contains("add-user"));
    }

    #[test]
    fn test_atelier_version() {
        atelier().arg("--version").assert().success();
    }

    #[test]
    fn test_unknown_subcommand_fails() {
        atelier().arg("reticulate").assert().failure();
    }

    #[test]
    fn test_serve_help_lists_flags() {
        atelier()
            .arg("serve")
            .arg("--help")
            .assert()
            .success()
            .stdout(predicate::str::contains("--port"))
            .stdout(predicate::str::contains("--images-url"))
            .stdout(predicate::str::contains("--dev"));
    }
}

// =============================================================================
// Database Setup Tests
// =============================================================================

mod database_setup {
    use super::*;

    #[test]
    fn test_init_db_creates_file() {
        let dir = create_temp_dir();

        atelier()
            .arg("init-db")
            .arg("--db")
            .arg(db_path(&dir))
            .assert()
            .success()
            .stdout(predicate::str::contains("Database ready"));

        assert!(db_path(&dir).exists());
    }

    #[test]
    fn test_init_db_idempotent() {
        let dir = create_temp_dir();
        init_db(&dir);

        // Second run migrates the existing file and succeeds
        atelier()
            .arg("init-db")
            .arg("--db")
            .arg(db_path(&dir))
            .assert()
            .success();
    }

    #[test]
    fn test_init_db_creates_parent_dirs() {
        let dir = create_temp_dir();
        let nested = dir.path().join("data/store/atelier.db");

        atelier()
            .arg("init-db")
            .arg("--db")
            .arg(&nested)
            .assert()
            .success();

        assert!(nested.exists());
    }

    #[test]
    fn test_init_db_default_path_is_cwd() {
        let dir = create_temp_dir();

        atelier()
            .current_dir(dir.path())
            .env_remove("ATELIER_DB")
            .arg("init-db")
            .assert()
            .success();

        assert!(dir.path().join("atelier.db").exists());
    }

    #[test]
    fn test_init_db_reads_env_var() {
        let dir = create_temp_dir();
        let via_env = dir.path().join("from-env.db");

        atelier()
            .env("ATELIER_DB", &via_env)
            .arg("init-db")
            .assert()
            .success();

        assert!(via_env.exists());
    }
}

// =============================================================================
// User Account Tests
// =============================================================================

mod user_accounts {
    use super::*;

    #[test]
    fn test_add_user() {
        let dir = create_temp_dir();

        atelier()
            .arg("add-user")
            .arg("kira")
            .arg("--password")
            .arg("correct horse")
            .arg("--db")
            .arg(db_path(&dir))
            .assert()
            .success()
            .stdout(predicate::str::contains("Created user kira (id 1)"));
    }

    #[test]
    fn test_add_moderator() {
        let dir = create_temp_dir();

        atelier()
            .arg("add-user")
            .arg("admin")
            .arg("--password")
            .arg("hunter2")
            .arg("--moderator")
            .arg("--db")
            .arg(db_path(&dir))
            .assert()
            .success()
            .stdout(predicate::str::contains("Created moderator admin"));
    }

    #[test]
    fn test_add_user_assigns_sequential_ids() {
        let dir = create_temp_dir();

        atelier()
            .arg("add-user")
            .arg("kira")
            .arg("--password")
            .arg("pw1")
            .arg("--db")
            .arg(db_path(&dir))
            .assert()
            .success()
            .stdout(predicate::str::contains("(id 1)"));

        atelier()
            .arg("add-user")
            .arg("lena")
            .arg("--password")
            .arg("pw2")
            .arg("--db")
            .arg(db_path(&dir))
            .assert()
            .success()
            .stdout(predicate::str::contains("(id 2)"));
    }

    #[test]
    fn test_add_user_duplicate_login_fails() {
        let dir = create_temp_dir();

        atelier()
            .arg("add-user")
            .arg("kira")
            .arg("--password")
            .arg("pw")
            .arg("--db")
            .arg(db_path(&dir))
            .assert()
            .success();

        atelier()
            .arg("add-user")
            .arg("kira")
            .arg("--password")
            .arg("other")
            .arg("--db")
            .arg(db_path(&dir))
            .assert()
            .failure()
            .stderr(predicate::str::contains("already taken"));
    }

    #[test]
    fn test_add_user_requires_password() {
        let dir = create_temp_dir();

        atelier()
            .arg("add-user")
            .arg("kira")
            .arg("--db")
            .arg(db_path(&dir))
            .assert()
            .failure()
            .stderr(predicate::str::contains("--password"));
    }

    #[test]
    fn test_add_user_works_on_existing_db() {
        let dir = create_temp_dir();
        init_db(&dir);

        atelier()
            .arg("add-user")
            .arg("kira")
            .arg("--password")
            .arg("pw")
            .arg("--db")
            .arg(db_path(&dir))
            .assert()
            .success();
    }
}

// =============================================================================
// End-to-End Bootstrap Tests
// =============================================================================

mod bootstrap_flow {
    use super::*;

    #[test]
    fn test_full_bootstrap() {
        let dir = create_temp_dir();

        // 1. Prepare the database
        init_db(&dir);

        // 2. Create a regular account and a moderator
        atelier()
            .arg("add-user")
            .arg("kira")
            .arg("--password")
            .arg("pw")
            .arg("--db")
            .arg(db_path(&dir))
            .assert()
            .success()
            .stdout(predicate::str::contains("Created user kira"));

        atelier()
            .arg("add-user")
            .arg("admin")
            .arg("--password")
            .arg("pw")
            .arg("--moderator")
            .arg("--db")
            .arg(db_path(&dir))
            .assert()
            .success()
            .stdout(predicate::str::contains("Created moderator admin"));

        // 3. Logins stay unique across invocations
        atelier()
            .arg("add-user")
            .arg("kira")
            .arg("--password")
            .arg("again")
            .arg("--db")
            .arg(db_path(&dir))
            .assert()
            .failure()
            .stderr(predicate::str::contains("already taken"));
    }
}
