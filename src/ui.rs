use colored::{ColoredString, Colorize};
use reconcile::{ChangeType, RiskLevel, WarningSeverity};

/// Print an info message
pub fn info(msg: &str) {
    println!("{} {}", "ℹ".blue(), msg);
}

/// Print a success message
pub fn success(msg: &str) {
    println!("{} {}", "✓".green(), msg);
}

/// Print a warning message
pub fn warn(msg: &str) {
    println!("{} {}", "⚠".yellow(), msg);
}

/// Print an error message
pub fn error(msg: &str) {
    eprintln!("{} {}", "✗".red(), msg);
}

/// Print a dim/muted message
pub fn dim(msg: &str) {
    println!("  {}", msg.dimmed());
}

/// Print a header/title
pub fn header(title: &str) {
    println!();
    println!("{}", title.bold());
    println!("{}", "─".repeat(title.chars().count()).dimmed());
}

/// Print a section header
pub fn section(title: &str) {
    println!();
    println!("{}", title.cyan().bold());
}

/// Print a key-value pair
pub fn kv(key: &str, value: &str) {
    println!("  {}: {}", key.dimmed(), value);
}

/// Colored `+`, `~`, `-/+`, `-` marker for a change
pub fn change_symbol(change: ChangeType) -> ColoredString {
    let symbol = change.symbol();
    match change {
        ChangeType::Create => symbol.green(),
        ChangeType::Update => symbol.yellow(),
        ChangeType::Replace => symbol.magenta(),
        ChangeType::Delete => symbol.red(),
        ChangeType::NoChange => symbol.dimmed(),
    }
}

pub fn risk(level: RiskLevel) -> ColoredString {
    let label = level.to_string();
    match level {
        RiskLevel::Low => label.dimmed(),
        RiskLevel::Medium => label.yellow(),
        RiskLevel::High => label.red().bold(),
    }
}

pub fn severity(level: WarningSeverity) -> ColoredString {
    let label = level.to_string();
    match level {
        WarningSeverity::Info => label.blue(),
        WarningSeverity::Warning => label.yellow(),
        WarningSeverity::Error => label.red().bold(),
    }
}

/// Shorten a hash for display
pub fn short_hash(hash: &str) -> &str {
    hash.get(..12).unwrap_or(hash)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_short_hash() {
        assert_eq!(short_hash("0123456789abcdef"), "0123456789ab");
        assert_eq!(short_hash("abc"), "abc");
        assert_eq!(short_hash(""), "");
    }
}
