// tests/common/mod.rs

//! Shared helpers for the build-action integration tests

use repoforge::actions::{ActionContext, ActionManager, BuildAction, BuildActionType};
use repoforge::setup::ServiceSetup;
use std::io::Write;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Create a fake tool script that prints its name and arguments
///
/// Mirrors the real tools closely enough for the engine: output lands in the
/// per-step log file, the exit code is always zero.
pub fn write_fake_tool(dir: &Path, name: &str) -> PathBuf {
    let path = dir.join(name);
    let content = format!("#!/bin/sh\necho \"fake {name}: $@\"\n");
    std::fs::write(&path, content).unwrap();
    let mut permissions = std::fs::metadata(&path).unwrap().permissions();
    permissions.set_mode(0o755);
    std::fs::set_permissions(&path, permissions).unwrap();
    path
}

/// Write a `.tar.gz` archive with the given files
pub fn write_tar_gz(path: &Path, files: &[(&str, &[u8])]) {
    let file = std::fs::File::create(path).unwrap();
    let encoder = flate2::write::GzEncoder::new(file, flate2::Compression::default());
    write_tar(encoder, files);
}

/// Write a `.tar.zst` archive with the given files
pub fn write_tar_zst(path: &Path, files: &[(&str, &[u8])]) {
    let file = std::fs::File::create(path).unwrap();
    let encoder = zstd::Encoder::new(file, 0).unwrap().auto_finish();
    write_tar(encoder, files);
}

fn write_tar(writer: impl Write, files: &[(&str, &[u8])]) {
    let mut builder = tar::Builder::new(writer);
    for (name, content) in files {
        let mut header = tar::Header::new_gnu();
        header.set_path(name).unwrap();
        header.set_size(content.len() as u64);
        header.set_mode(0o644);
        header.set_cksum();
        builder.append(&header, *content).unwrap();
    }
    builder.into_inner().unwrap().flush().unwrap();
}

/// Run one build action to completion and return its final state
pub async fn run_build_action(
    setup: &Arc<ServiceSetup>,
    draft: BuildAction,
) -> BuildAction {
    let action = ActionManager::create(setup, draft);
    let id = action.read().unwrap().id;
    ActionManager::enqueue(setup, id).unwrap();
    let context = ActionContext::new(Arc::clone(setup), Arc::clone(&action));
    context.finished().await;
    let snapshot = action.read().unwrap().clone();
    snapshot
}

/// A draft for the given action type with empty inputs
pub fn draft(action_type: BuildActionType) -> BuildAction {
    let mut action = BuildAction::default();
    action.action_type = action_type;
    action
}
