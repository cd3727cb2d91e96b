// ABOUTME: CLI commands that go through a tenant's resolved capabilities: exec, ls, sessions, mode
// ABOUTME: Output is identical whichever adapter mode serves the tenant

use super::context::Context;
use anyhow::{bail, Result};
use async_trait::async_trait;
use colored::*;
use comfy_table::{modifiers::UTF8_ROUND_CORNERS, presets::UTF8_FULL, ContentArrangement, Table};
use std::io::Write;
use std::sync::Arc;
use warden_config::AdapterMode;
use warden_runtime::{
    Channel, ExecutionError, ExecutionRequest, FileNode, FileOperationError, NodeKind,
    OutputChunk, OutputSink, PageRequest, SinkError,
};

/// Forwards command output to this process's stdout and stderr
struct StdioSink;

#[async_trait]
impl OutputSink for StdioSink {
    async fn write(&self, chunk: OutputChunk) -> Result<(), SinkError> {
        let written = match chunk.channel {
            Channel::Stdout => {
                let mut out = std::io::stdout().lock();
                out.write_all(&chunk.data).and_then(|_| out.flush())
            }
            Channel::Stderr => {
                let mut err = std::io::stderr().lock();
                err.write_all(&chunk.data).and_then(|_| err.flush())
            }
        };
        written.map_err(|_| SinkError::Closed)
    }

    fn is_streaming(&self) -> bool {
        true
    }
}

/// Run a command for the tenant and return its exit code
pub async fn exec(ctx: &Context, tenant: &str, cwd: Option<String>, command: &[String]) -> Result<i32> {
    if command.is_empty() {
        bail!("No command given");
    }
    let caps = ctx.factory.for_tenant(tenant).await?;
    let mut request = ExecutionRequest::new(
        uuid::Uuid::new_v4().to_string(),
        command.join(" "),
        Arc::new(StdioSink),
    );
    if let Some(cwd) = cwd {
        request = request.with_cwd(cwd);
    }

    match caps.execution.execute(request).await {
        Ok(result) => Ok(result
            .exit_code
            .and_then(|code| i32::try_from(code).ok())
            .unwrap_or(1)),
        Err(ExecutionError::NotReady) => {
            eprintln!(
                "{} Sandbox for {} is still starting, try again shortly",
                "⏳".yellow(),
                tenant
            );
            Ok(75)
        }
        Err(e) => Err(e.into()),
    }
}

pub async fn mode(ctx: &Context, tenant: &str, set: Option<AdapterMode>) -> Result<()> {
    let modes = ctx.factory.modes();
    if let Some(mode) = set {
        modes.set(tenant, mode).await?;
        println!("{} {} now uses {} adapters", "✅".green(), tenant, mode);
        return Ok(());
    }
    let mode = modes.resolve(tenant).await?;
    println!(
        "{}: {} {}",
        tenant,
        mode.to_string().bold(),
        format!("(server default: {})", modes.default_mode()).dimmed()
    );
    Ok(())
}

pub async fn ls(ctx: &Context, tenant: &str, path: &str, depth: usize) -> Result<()> {
    let caps = ctx.factory.for_tenant(tenant).await?;
    match caps.files.tree(path, depth).await {
        Ok(tree) => {
            let mut out = String::new();
            render_tree(&tree, 0, &mut out);
            print!("{}", out);
            Ok(())
        }
        Err(FileOperationError::NotReady) => {
            println!("{}", "Sandbox is still starting, nothing to list yet".yellow());
            Ok(())
        }
        Err(e) => Err(e.into()),
    }
}

fn render_tree(node: &FileNode, level: usize, out: &mut String) {
    let indent = "  ".repeat(level);
    let label = match node.kind {
        NodeKind::Directory => format!("{}/", node.name).blue().bold().to_string(),
        NodeKind::Symlink => format!(
            "{} -> {}",
            node.name.cyan(),
            node.target.as_deref().unwrap_or("?")
        ),
        NodeKind::File => format!("{} {}", node.name, format!("({} B)", node.size).dimmed()),
    };
    if level == 0 {
        out.push_str(&format!("{}\n", node.path.bold()));
    } else {
        out.push_str(&format!("{}{} {}\n", indent, node.permissions.dimmed(), label));
    }
    for child in node.children.iter().flatten() {
        render_tree(child, level + 1, out);
    }
}

pub async fn sessions(
    ctx: &Context,
    tenant: &str,
    project: Option<&str>,
    offset: usize,
    limit: usize,
) -> Result<()> {
    let caps = ctx.factory.for_tenant(tenant).await?;
    let page = caps
        .sessions
        .list_sessions(project, PageRequest::new(offset, limit))
        .await?;

    if page.pending {
        println!("{}", "Sandbox is still starting, sessions will appear shortly".yellow());
        return Ok(());
    }
    if page.items.is_empty() {
        println!("{}", "No sessions found".yellow());
        return Ok(());
    }

    let mut table = Table::new();
    table
        .load_preset(UTF8_FULL)
        .apply_modifier(UTF8_ROUND_CORNERS)
        .set_content_arrangement(ContentArrangement::Dynamic);
    table.set_header(vec!["Session", "Project", "Modified", "Size", "Title"]);
    for session in &page.items {
        table.add_row(vec![
            session.id.clone(),
            session.project.clone(),
            session.modified.format("%Y-%m-%d %H:%M").to_string(),
            session.size.to_string(),
            session.title.clone().unwrap_or_default(),
        ]);
    }
    println!("{}", table);
    println!(
        "Showing {}-{} of {}{}",
        page.offset + 1,
        page.offset + page.items.len(),
        page.total,
        if page.has_more { " (more available)" } else { "" }
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn node(name: &str, kind: NodeKind, children: Option<Vec<FileNode>>) -> FileNode {
        FileNode {
            name: name.to_string(),
            path: format!("/{}", name),
            kind,
            size: 3,
            permissions: "-rw-r--r--".to_string(),
            target: None,
            children,
        }
    }

    #[test]
    fn test_render_tree_indents_children() {
        colored::control::set_override(false);
        let tree = FileNode {
            name: String::new(),
            path: "/".to_string(),
            kind: NodeKind::Directory,
            size: 0,
            permissions: String::new(),
            target: None,
            children: Some(vec![
                node("src", NodeKind::Directory, Some(vec![node("main.rs", NodeKind::File, None)])),
                node("a.txt", NodeKind::File, None),
            ]),
        };
        let mut out = String::new();
        render_tree(&tree, 0, &mut out);
        assert_eq!(
            out,
            "/\n  -rw-r--r-- src/\n    -rw-r--r-- main.rs (3 B)\n  -rw-r--r-- a.txt (3 B)\n"
        );
    }
}
