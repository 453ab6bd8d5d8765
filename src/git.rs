use crate::models::RepoInfo;
use std::path::Path;
use std::process::Command;

/// Read-only probe of the repository containing `cwd`.
pub fn detect_repo_info(cwd: &Path) -> Option<RepoInfo> {
    let root = run_git_command(cwd, &["rev-parse", "--show-toplevel"])?;
    let root = root.trim().to_string();
    let branch = run_git_command(cwd, &["rev-parse", "--abbrev-ref", "HEAD"]);
    let status = run_git_command(cwd, &["status", "--porcelain"]).unwrap_or_default();

    let project = Path::new(&root)
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| root.clone());

    Some(RepoInfo {
        root,
        project,
        branch: branch.and_then(|b| {
            let b = b.trim().to_string();
            if b == "HEAD" { None } else { Some(b) }
        }),
        files_changed: parse_porcelain(&status),
    })
}

/// Paths from `git status --porcelain`. Renames report the new path.
fn parse_porcelain(output: &str) -> Vec<String> {
    output
        .lines()
        .filter(|line| line.len() > 3)
        .map(|line| {
            let path = &line[3..];
            let path = match path.split_once(" -> ") {
                Some((_, to)) => to,
                None => path,
            };
            path.trim_matches('"').to_string()
        })
        .collect()
}

fn run_git_command(cwd: &Path, args: &[&str]) -> Option<String> {
    Command::new("git")
        .current_dir(cwd)
        .args(args)
        .output()
        .ok()
        .filter(|output| output.status.success())
        .and_then(|output| String::from_utf8(output.stdout).ok())
}
