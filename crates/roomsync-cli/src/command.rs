//! REPL command parsing

use roomsync_core::Position;

#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    Add(Position),
    Clear,
    List,
    Status,
    Link,
    Help,
    Quit,
}

impl Command {
    pub fn parse(line: &str) -> Result<Self, String> {
        let mut parts = line.split_whitespace();
        let name = parts.next().unwrap_or_default().to_lowercase();

        let command = match name.as_str() {
            "add" => {
                let lat = coordinate(parts.next(), "lat")?;
                let lng = coordinate(parts.next(), "lng")?;
                Command::Add(Position::new(lat, lng))
            }
            "clear" => Command::Clear,
            "list" | "ls" => Command::List,
            "status" => Command::Status,
            "link" => Command::Link,
            "help" | "?" => Command::Help,
            "quit" | "exit" => Command::Quit,
            "" => return Err("empty command".into()),
            other => return Err(format!("unknown command '{}', try 'help'", other)),
        };

        if let Some(extra) = parts.next() {
            return Err(format!("unexpected argument '{}'", extra));
        }
        Ok(command)
    }
}

fn coordinate(value: Option<&str>, name: &str) -> Result<f64, String> {
    let value = value.ok_or_else(|| format!("missing <{}>", name))?;
    let parsed: f64 = value
        .parse()
        .map_err(|_| format!("<{}> must be a number, got '{}'", name, value))?;
    if !parsed.is_finite() {
        return Err(format!("<{}> must be finite", name));
    }
    Ok(parsed)
}

/// Whether a confirmation answer means yes
pub fn confirmed(answer: &str) -> bool {
    matches!(answer.trim().to_lowercase().as_str(), "y" | "yes")
}
