//! Input validation for rule documents
//!
//! Every check here runs before a rule reaches the store, so a rejected
//! document never causes a partial write.

use ipnetwork::IpNetwork;

/// Sanitizes a rule name for logs and map comments.
///
/// Removes control characters and limits length to 64 characters.
///
/// # Examples
///
/// ```
/// use pfw::validators::sanitize_label;
///
/// assert_eq!(sanitize_label("Block TCP test"), "Block TCP test");
/// assert!(!sanitize_label("a\nb").contains('\n'));
/// ```
pub fn sanitize_label(input: &str) -> String {
    input.chars().filter(|c| !c.is_control()).take(64).collect()
}

/// Validates a `RuleName`. Names are free-form and need not be unique.
///
/// # Errors
///
/// Returns `Err` if the name exceeds 64 characters or carries control characters.
pub fn validate_label(input: &str) -> Result<(), String> {
    if input.chars().count() > 64 {
        return Err("RuleName too long (max 64 characters)".to_string());
    }
    if input.chars().any(char::is_control) {
        return Err("RuleName contains control characters".to_string());
    }
    Ok(())
}

/// Validates a port range.
///
/// # Errors
///
/// Returns `Err` if the start port is greater than the end port.
pub fn validate_port_range(start: u16, end: u16) -> Result<(u16, u16), String> {
    if start > end {
        Err("Start port must be less than or equal to end port".to_string())
    } else {
        Ok((start, end))
    }
}

/// Parses a port field: empty, a single port (`"80"`) or a range (`"8000-8080"`).
///
/// Returns `None` for the empty string.
///
/// # Errors
///
/// Returns `Err` for anything else, including out-of-range numbers.
pub fn parse_port_spec(input: &str) -> Result<Option<(u16, u16)>, String> {
    if input.is_empty() {
        return Ok(None);
    }
    let parse = |s: &str| {
        if s.is_empty() || !s.bytes().all(|b| b.is_ascii_digit()) {
            return Err(format!("Invalid port '{input}'"));
        }
        s.parse::<u16>()
            .map_err(|_| format!("Port out of range in '{input}' (max 65535)"))
    };
    let (start, end) = match input.split_once('-') {
        Some((a, b)) => (parse(a)?, parse(b)?),
        None => {
            let p = parse(input)?;
            (p, p)
        }
    };
    validate_port_range(start, end).map(Some)
}

/// Validates a network interface name.
///
/// Linux kernel interface name rules:
/// - Max 15 characters (IFNAMSIZ - 1)
/// - Alphanumeric, dot, dash, underscore only
/// - Cannot be "." or ".."
///
/// # Errors
///
/// Returns `Err` if interface name violates kernel constraints.
pub fn validate_interface(name: &str) -> Result<String, String> {
    if name.is_empty() {
        return Ok(String::new());
    }

    if name.len() > 15 {
        return Err("Interface name too long (max 15 characters)".to_string());
    }

    if name == "." || name == ".." {
        return Err("Invalid interface name".to_string());
    }

    if !name
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_'))
    {
        return Err("Interface name contains invalid characters".to_string());
    }

    Ok(name.to_string())
}

/// Validates a strict `HH:MM` wall-clock time.
///
/// # Errors
///
/// Returns `Err` unless the input is two-digit hours 00-23 and minutes 00-59.
pub fn validate_clock(input: &str) -> Result<(), String> {
    let bytes = input.as_bytes();
    let well_formed = bytes.len() == 5
        && bytes[2] == b':'
        && [0, 1, 3, 4].iter().all(|&i| bytes[i].is_ascii_digit());
    if !well_formed {
        return Err(format!("Invalid time '{input}' (expected HH:MM)"));
    }
    let hours = u32::from(bytes[0] - b'0') * 10 + u32::from(bytes[1] - b'0');
    let minutes = u32::from(bytes[3] - b'0') * 10 + u32::from(bytes[4] - b'0');
    if hours > 23 || minutes > 59 {
        return Err(format!("Invalid time '{input}' (out of range)"));
    }
    Ok(())
}

/// Parses an IP address or CIDR network.
///
/// # Errors
///
/// Returns `Err` if the input is neither.
pub fn parse_address(input: &str) -> Result<IpNetwork, String> {
    input
        .trim()
        .parse::<IpNetwork>()
        .map_err(|_| format!("Invalid IP address or CIDR '{input}'"))
}

/// True when the input is exactly four dot-separated decimal octets.
pub fn is_dotted_quad(input: &str) -> bool {
    let parts: Vec<&str> = input.split('.').collect();
    parts.len() == 4
        && parts.iter().all(|p| {
            !p.is_empty() && p.len() <= 3 && p.bytes().all(|b| b.is_ascii_digit())
        })
        && parts.iter().all(|p| p.parse::<u8>().is_ok())
}

/// Validates a variable name used in `Condition` expressions.
///
/// # Errors
///
/// Returns `Err` unless the name is an identifier of at most 64 characters.
pub fn validate_variable_name(name: &str) -> Result<(), String> {
    let mut chars = name.chars();
    let Some(first) = chars.next() else {
        return Err("Variable name cannot be empty".to_string());
    };
    if name.len() > 64 {
        return Err("Variable name too long (max 64 characters)".to_string());
    }
    if !(first.is_ascii_alphabetic() || first == '_')
        || !chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
    {
        return Err(format!("Invalid variable name '{name}'"));
    }
    Ok(())
}
