//! Output rendering for the atlas CLI.
//!
//! Formats workspace and task state for terminal display (Section 6: CLI
//! surface).

use atlas_core::{Task, TaskStatus, Workspace, WorkspaceStatus};

fn truncate(s: &str, max_len: usize) -> String {
    if s.len() <= max_len {
        s.to_string()
    } else {
        format!("{}...", &s[..max_len - 3])
    }
}

fn format_time(dt: &chrono::DateTime<chrono::Utc>) -> String {
    dt.format("%Y-%m-%d %H:%M:%S").to_string()
}

fn format_task_status(status: TaskStatus) -> &'static str {
    status.as_str()
}

fn format_workspace_status(status: WorkspaceStatus) -> &'static str {
    status.as_str()
}

/// Print confirmation after creating a task.
pub fn print_task_created(task: &Task) {
    println!("Created task: {}", task.id);
    println!("  Workspace: {}", task.workspace);
    println!("  Template:  {}", task.template);
    println!("  Status:    {}", format_task_status(task.status));
    println!("  Steps:     {}", task.total_steps);
}

/// Print a list of tasks in tabular format.
pub fn print_task_list(tasks: &[Task]) {
    if tasks.is_empty() {
        println!("No tasks found.");
        return;
    }

    println!("{:<38}  {:<16}  {:<18}  {:<8}  {:<20}", "ID", "WORKSPACE", "STATUS", "STEP", "CREATED");
    println!("{}", "-".repeat(104));

    for task in tasks {
        println!(
            "{:<38}  {:<16}  {:<18}  {:<8}  {:<20}",
            task.id,
            truncate(task.workspace.as_str(), 16),
            format_task_status(task.status),
            format!("{}/{}", task.current_step_index.min(task.total_steps), task.total_steps),
            format_time(&task.created_at),
        );
    }

    println!();
    println!("{} task(s)", tasks.len());
}

/// Print detailed information about a task and its steps.
pub fn print_task_details(task: &Task) {
    println!("Task: {}", task.id);
    println!();
    println!("  Workspace:   {}", task.workspace);
    println!("  Template:    {}", task.template);
    println!("  Status:      {}", format_task_status(task.status));
    println!("  Description: {}", task.description);
    println!("  Created:     {}", format_time(&task.created_at));
    println!("  Updated:     {}", format_time(&task.updated_at));

    if !task.steps.is_empty() {
        println!();
        println!("  Steps:");
        println!("    {:<4}{:<20}  {:<12}  {:<8}  {}", "", "NAME", "STATUS", "ATTEMPT", "ERROR");
        println!("    {}", "-".repeat(80));
        for (i, step) in task.steps.iter().enumerate() {
            let marker = if i == task.current_step_index { ">" } else { " " };
            println!(
                "    {marker:<4}{:<20}  {:<12}  {:<8}  {}",
                step.name,
                step.status.as_str(),
                step.attempt,
                step.error.as_deref().unwrap_or("-"),
            );
        }
    }

    if task.status.needs_attention() {
        println!();
        println!("  Needs attention: {}", format_task_status(task.status));
    }
}

/// Print a list of workspaces in tabular format.
pub fn print_workspace_list(workspaces: &[Workspace]) {
    if workspaces.is_empty() {
        println!("No workspaces found.");
        return;
    }

    println!("{:<20}  {:<10}  {:<28}  {}", "NAME", "STATUS", "BRANCH", "WORKTREE");
    println!("{}", "-".repeat(100));

    for ws in workspaces {
        println!(
            "{:<20}  {:<10}  {:<28}  {}",
            ws.name.as_str(),
            format_workspace_status(ws.status),
            ws.branch,
            ws.worktree_path,
        );
    }

    println!();
    println!("{} workspace(s)", workspaces.len());
}

/// Print confirmation after creating a workspace.
pub fn print_workspace_created(ws: &Workspace) {
    println!("Created workspace: {}", ws.name.as_str());
    println!("  Branch:   {}", ws.branch);
    println!("  Worktree: {}", ws.worktree_path);
    println!("  Base:     {}", ws.base_branch);
}
