/*
 * render_integration.rs
 * Copyright (c) 2025 Posit, PBC
 *
 * Integration tests for the tenjin render command.
 */

//! Runs the built `tenjin` binary against templates in a scratch directory.

use std::fs;
use std::path::Path;
use std::process::{Command, Output};
use tempfile::TempDir;

fn tenjin(dir: &Path, args: &[&str]) -> Output {
    Command::new(env!("CARGO_BIN_EXE_tenjin"))
        .current_dir(dir)
        .env("RUST_LOG", "tenjin=warn")
        .args(args)
        .output()
        .expect("Failed to run tenjin")
}

fn site() -> TempDir {
    let temp = TempDir::new().expect("Failed to create temp directory");
    let views = temp.path().join("views");
    fs::create_dir_all(&views).unwrap();
    fs::write(
        views.join("layout.lhtml"),
        "<html><body>\n${_content}</body></html>\n",
    )
    .unwrap();
    fs::write(
        views.join("page.lhtml"),
        "<?lua #@ARGS title ?>\n<h1>${title}</h1>\n",
    )
    .unwrap();
    fs::write(
        temp.path().join("engine.toml"),
        "postfix = \".lhtml\"\nlayout = \":layout\"\npath = [\"views\"]\n",
    )
    .unwrap();
    fs::write(temp.path().join("ctx.json"), r#"{"title": "Tom & Jerry"}"#).unwrap();
    temp
}

#[test]
fn test_render_to_stdout() {
    let temp = site();
    let out = tenjin(
        temp.path(),
        &["render", ":page", "-c", "ctx.json", "--config", "engine.toml"],
    );
    assert!(out.status.success(), "{}", String::from_utf8_lossy(&out.stderr));
    assert_eq!(
        String::from_utf8_lossy(&out.stdout),
        "<html><body>\n<h1>Tom &amp; Jerry</h1>\n</body></html>\n"
    );
    // the default text cache lands next to the templates
    assert!(temp.path().join("views/page.lhtml.cache").is_file());
}

#[test]
fn test_render_to_file_without_cache_files() {
    let temp = site();
    let out = tenjin(
        temp.path(),
        &[
            "render",
            ":page",
            "-c",
            "ctx.json",
            "--config",
            "engine.toml",
            "--layout",
            "",
            "--no-cache",
            "-o",
            "out.html",
        ],
    );
    assert!(out.status.success(), "{}", String::from_utf8_lossy(&out.stderr));
    assert_eq!(
        fs::read_to_string(temp.path().join("out.html")).unwrap(),
        "<h1>Tom &amp; Jerry</h1>\n"
    );
    assert!(!temp.path().join("views/page.lhtml.cache").exists());
}

#[test]
fn test_missing_argument_fails() {
    let temp = site();
    let out = tenjin(temp.path(), &["render", ":page", "--config", "engine.toml"]);
    assert!(!out.status.success());
    assert!(String::from_utf8_lossy(&out.stderr).contains("title"));
}

#[test]
fn test_safe_flag_rejects_raw_expressions() {
    let temp = site();
    fs::write(temp.path().join("raw.lhtml"), "#{title}\n").unwrap();
    let out = tenjin(
        temp.path(),
        &["render", "raw.lhtml", "-c", "ctx.json", "--safe", "--no-cache"],
    );
    assert!(!out.status.success());
    assert!(String::from_utf8_lossy(&out.stderr).contains("not allowed in safe templates"));
}
