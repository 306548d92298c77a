use std::io::Write;

/// Write JSON string to stdout.
pub fn write_output(json: &str) -> Result<(), String> {
    let stdout = std::io::stdout();
    let mut handle = stdout.lock();
    handle
        .write_all(json.as_bytes())
        .and_then(|_| handle.write_all(b"\n"))
        .map_err(|e| format!("Failed to write to stdout: {}", e))
}

/// Serialize a value to pretty JSON.
pub fn to_json<T: serde::Serialize>(value: &T) -> Result<String, String> {
    serde_json::to_string_pretty(value).map_err(|e| format!("JSON serialization failed: {}", e))
}

/// Serialize and print, mapping failure to an exit code.
pub fn emit_json<T: serde::Serialize>(value: &T) -> Result<(), i32> {
    to_json(value).and_then(|json| write_output(&json)).map_err(|e| {
        eprintln!("Error: {}", e);
        crate::exit_codes::EXECUTION_ERROR
    })
}

/// Render a microsecond timestamp as UTC, for human-readable tables.
pub fn format_us(timestamp_us: i64) -> String {
    chrono::DateTime::from_timestamp_micros(timestamp_us)
        .map(|dt| dt.format("%Y-%m-%d %H:%M:%S%.3f").to_string())
        .unwrap_or_else(|| format!("{}us", timestamp_us))
}

pub fn format_bytes(bytes: u64) -> String {
    const UNITS: [&str; 5] = ["B", "KiB", "MiB", "GiB", "TiB"];
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{} B", bytes)
    } else {
        format!("{:.2} {}", value, UNITS[unit])
    }
}
