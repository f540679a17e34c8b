use std::io::Write;

use colored::*;
use terminal_size::{Width, Height, terminal_size};

use crate::session::{ContextBudget, Message, Mode, SendStatus, ToolCallRequest};

pub fn print_header(model: Option<&str>, mode: &Mode) {
    let (width, _) = terminal_size().unwrap_or((Width(80), Height(24)));
    let width = width.0 as usize;

    let line = "─".repeat(width);
    println!("{}", line.black().bold());

    let name = "convo".yellow().bold();
    let version = format!("v{}", env!("CARGO_PKG_VERSION")).black().bold();
    println!("  {} {}", name, version);

    // Model + Mode Info
    let info = format!("  {}  •  {}", model.unwrap_or("default model"), mode.label()).cyan();
    println!("{}", info);

    println!("{}", line.black().bold());
}

pub fn print_step(msg: &str) {
    println!("  {} {}", "•".green(), msg);
}

pub fn print_success(msg: &str) {
    println!("  {} {}", "✓".green().bold(), msg.green());
}

pub fn print_warning(msg: &str) {
    println!("  {} {}", "⚠️ ".yellow().bold(), msg.yellow());
}

pub fn print_error(msg: &str) {
    println!("  {} {}", "❌".red().bold(), msg.red());
}

pub fn print_thinking(msg: &str) {
    println!("  {} {}...", "∴".magenta(), msg);
}

/// Streamed text, printed as it arrives
pub fn print_delta(text: &str) {
    print!("{}", text);
    let _ = std::io::stdout().flush();
}

pub fn print_tool_call(request: &ToolCallRequest) {
    println!(
        "\n  {} {}/{} {}",
        "⚙".blue(),
        request.server_id,
        request.tool_name.bold(),
        request.parameters.to_string().black().bold()
    );
}

pub fn print_tool_result(message: &Message) {
    let preview: String = message.content.chars().take(120).collect();
    println!("  {} {}", "↳".blue(), preview.black().bold());
}

pub fn print_turn_end(status: &SendStatus) {
    match status {
        SendStatus::Completed => println!(),
        SendStatus::Cancelled => println!("\n  {}", "[cancelled]".yellow()),
        SendStatus::StreamFailed(reason) => println!("\n  {} {}", "[stream failed]".red(), reason),
        SendStatus::MaxIterationsExceeded => println!("\n  {}", "[tool iteration limit reached]".yellow()),
    }
}

pub fn print_budget(budget: &ContextBudget) {
    let pct = budget.used_fraction() * 100.0;
    let text = format!("context {}", budget.summary());
    let styled = if pct >= 80.0 { text.yellow() } else { text.black().bold() };
    println!("  {}", styled);
}
