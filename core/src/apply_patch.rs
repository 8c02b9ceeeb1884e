//! The `apply_patch` internal command: applies a structured patch
//! envelope to the filesystem, confined to the step's working directory.
//!
//! Envelope grammar:
//!
//! ```text
//! *** Begin Patch
//! *** Add File: relative/path
//! +file contents, one line per `+`
//! *** Update File: relative/path
//! *** Move to: new/relative/path        (optional)
//! @@ optional locator text
//!  context line
//! -removed line
//! +added line
//! *** Delete File: relative/path
//! *** End Patch
//! ```

use std::path::Component;
use std::path::Path;
use std::path::PathBuf;

use async_trait::async_trait;

use crate::error::AgentErr;
use crate::error::Result;
use crate::exec::CommandOutcome;
use crate::internal_commands::InternalCommand;
use crate::internal_commands::InternalCommandRequest;

const BEGIN_MARKER: &str = "*** Begin Patch";
const END_MARKER: &str = "*** End Patch";
const ADD_MARKER: &str = "*** Add File: ";
const DELETE_MARKER: &str = "*** Delete File: ";
const UPDATE_MARKER: &str = "*** Update File: ";
const MOVE_MARKER: &str = "*** Move to: ";

pub struct ApplyPatchCommand;

#[async_trait]
impl InternalCommand for ApplyPatchCommand {
    fn name(&self) -> &'static str {
        "apply_patch"
    }

    async fn run(&self, req: InternalCommandRequest) -> Result<CommandOutcome> {
        let Some(start) = req.raw.find(BEGIN_MARKER) else {
            return Err(AgentErr::InternalCommand(format!(
                "apply_patch: missing `{BEGIN_MARKER}` envelope"
            )));
        };
        let summary = apply_patch(&req.raw[start..], &req.cwd)?;
        Ok(CommandOutcome {
            stdout: summary,
            exit_code: Some(0),
            ..Default::default()
        })
    }
}

#[derive(Debug, PartialEq)]
enum Hunk {
    Add {
        path: String,
        contents: String,
    },
    Delete {
        path: String,
    },
    Update {
        path: String,
        move_to: Option<String>,
        chunks: Vec<Chunk>,
    },
}

/// One `@@` section of an update hunk: the lines to find and what to
/// replace them with.
#[derive(Debug, Default, PartialEq)]
struct Chunk {
    old_lines: Vec<String>,
    new_lines: Vec<String>,
}

/// Parse and apply a patch envelope rooted at `root`. Returns a per-file
/// summary for the observation.
pub fn apply_patch(patch: &str, root: &Path) -> Result<String> {
    let hunks = parse_patch(patch)?;
    if hunks.is_empty() {
        return Err(AgentErr::InternalCommand(
            "apply_patch: patch contains no file sections".to_string(),
        ));
    }
    let mut summary = Vec::new();
    for hunk in &hunks {
        match hunk {
            Hunk::Add { path, contents } => {
                let target = resolve(root, path)?;
                if let Some(parent) = target.parent() {
                    std::fs::create_dir_all(parent)?;
                }
                std::fs::write(&target, contents)?;
                summary.push(format!("A {path}"));
            }
            Hunk::Delete { path } => {
                let target = resolve(root, path)?;
                std::fs::remove_file(&target).map_err(|err| {
                    AgentErr::InternalCommand(format!("apply_patch: delete {path}: {err}"))
                })?;
                summary.push(format!("D {path}"));
            }
            Hunk::Update {
                path,
                move_to,
                chunks,
            } => {
                let source = resolve(root, path)?;
                let original = std::fs::read_to_string(&source).map_err(|err| {
                    AgentErr::InternalCommand(format!("apply_patch: read {path}: {err}"))
                })?;
                let updated = apply_chunks(&original, chunks, path)?;
                match move_to {
                    Some(new_path) => {
                        let target = resolve(root, new_path)?;
                        if let Some(parent) = target.parent() {
                            std::fs::create_dir_all(parent)?;
                        }
                        std::fs::write(&target, updated)?;
                        std::fs::remove_file(&source)?;
                        summary.push(format!("R {path} -> {new_path}"));
                    }
                    None => {
                        std::fs::write(&source, updated)?;
                        summary.push(format!("M {path}"));
                    }
                }
            }
        }
    }
    Ok(format!(
        "applied patch to {} file(s)\n{}",
        summary.len(),
        summary.join("\n")
    ))
}

fn parse_patch(patch: &str) -> Result<Vec<Hunk>> {
    let mut lines = patch.lines();
    loop {
        match lines.next() {
            Some(line) if line.trim() == BEGIN_MARKER => break,
            Some(_) => continue,
            None => {
                return Err(AgentErr::InternalCommand(format!(
                    "apply_patch: missing `{BEGIN_MARKER}`"
                )))
            }
        }
    }

    let mut hunks = Vec::new();
    let mut saw_end = false;
    let mut pending: Option<Hunk> = None;

    for line in lines {
        if line.trim() == END_MARKER {
            saw_end = true;
            break;
        }
        if let Some(path) = line.strip_prefix(ADD_MARKER) {
            flush(&mut hunks, pending.take());
            pending = Some(Hunk::Add {
                path: path.trim().to_string(),
                contents: String::new(),
            });
        } else if let Some(path) = line.strip_prefix(DELETE_MARKER) {
            flush(&mut hunks, pending.take());
            hunks.push(Hunk::Delete {
                path: path.trim().to_string(),
            });
        } else if let Some(path) = line.strip_prefix(UPDATE_MARKER) {
            flush(&mut hunks, pending.take());
            pending = Some(Hunk::Update {
                path: path.trim().to_string(),
                move_to: None,
                chunks: Vec::new(),
            });
        } else if let Some(new_path) = line.strip_prefix(MOVE_MARKER) {
            match &mut pending {
                Some(Hunk::Update { move_to, .. }) => {
                    *move_to = Some(new_path.trim().to_string());
                }
                _ => {
                    return Err(AgentErr::InternalCommand(
                        "apply_patch: `*** Move to:` outside an update section".to_string(),
                    ))
                }
            }
        } else {
            match &mut pending {
                Some(Hunk::Add { contents, .. }) => {
                    let Some(body) = line.strip_prefix('+') else {
                        return Err(AgentErr::InternalCommand(format!(
                            "apply_patch: add sections only take `+` lines, got: {line}"
                        )));
                    };
                    contents.push_str(body);
                    contents.push('\n');
                }
                Some(Hunk::Update { chunks, .. }) => {
                    if line.starts_with("@@") {
                        chunks.push(Chunk::default());
                        continue;
                    }
                    if chunks.is_empty() {
                        chunks.push(Chunk::default());
                    }
                    let Some(chunk) = chunks.last_mut() else {
                        continue;
                    };
                    if let Some(body) = line.strip_prefix('+') {
                        chunk.new_lines.push(body.to_string());
                    } else if let Some(body) = line.strip_prefix('-') {
                        chunk.old_lines.push(body.to_string());
                    } else {
                        let body = line.strip_prefix(' ').unwrap_or(line);
                        chunk.old_lines.push(body.to_string());
                        chunk.new_lines.push(body.to_string());
                    }
                }
                _ => {
                    if !line.trim().is_empty() {
                        return Err(AgentErr::InternalCommand(format!(
                            "apply_patch: content outside a file section: {line}"
                        )));
                    }
                }
            }
        }
    }

    if !saw_end {
        return Err(AgentErr::InternalCommand(format!(
            "apply_patch: missing `{END_MARKER}`"
        )));
    }
    flush(&mut hunks, pending.take());
    Ok(hunks)
}

fn flush(hunks: &mut Vec<Hunk>, pending: Option<Hunk>) {
    if let Some(hunk) = pending {
        hunks.push(hunk);
    }
}

fn apply_chunks(original: &str, chunks: &[Chunk], path: &str) -> Result<String> {
    let mut lines: Vec<String> = original.lines().map(str::to_string).collect();
    let ends_with_newline = original.ends_with('\n') || original.is_empty();
    let mut search_from = 0usize;

    for chunk in chunks {
        if chunk.old_lines.is_empty() {
            // Pure insertion without context: append at the end.
            lines.extend(chunk.new_lines.iter().cloned());
            continue;
        }
        let found = (search_from..=lines.len().saturating_sub(chunk.old_lines.len()))
            .find(|&i| lines[i..i + chunk.old_lines.len()] == chunk.old_lines[..]);
        let Some(at) = found else {
            return Err(AgentErr::InternalCommand(format!(
                "apply_patch: context not found in {path}: {:?}",
                chunk.old_lines.first()
            )));
        };
        lines.splice(at..at + chunk.old_lines.len(), chunk.new_lines.iter().cloned());
        search_from = at + chunk.new_lines.len();
    }

    let mut out = lines.join("\n");
    if ends_with_newline && !out.is_empty() {
        out.push('\n');
    }
    Ok(out)
}

/// Join a patch path onto the root, rejecting anything that would escape
/// it. Absolute paths and `..` components are refused outright.
fn resolve(root: &Path, rel: &str) -> Result<PathBuf> {
    let candidate = Path::new(rel);
    if candidate.is_absolute() {
        return Err(AgentErr::InternalCommand(format!(
            "apply_patch: absolute paths are not allowed: {rel}"
        )));
    }
    for component in candidate.components() {
        match component {
            Component::Normal(_) | Component::CurDir => {}
            _ => {
                return Err(AgentErr::InternalCommand(format!(
                    "apply_patch: path escapes the working directory: {rel}"
                )))
            }
        }
    }
    Ok(root.join(candidate))
}
