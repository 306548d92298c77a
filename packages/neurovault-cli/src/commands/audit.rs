use crate::cli::AuditArgs;
use crate::commands::{fail, prepare};
use crate::exit_codes;
use crate::output;
use neurovault::AuditEventType;

pub fn execute(args: AuditArgs) -> i32 {
    let event_type = match args.event_type.as_deref() {
        Some(raw) => match AuditEventType::from_str(&raw.to_ascii_uppercase()) {
            Some(event_type) => Some(event_type),
            None => {
                eprintln!("Error: Unknown audit event type '{}'", raw);
                return exit_codes::INPUT_ERROR;
            }
        },
        None => None,
    };

    let (_, store) = match prepare(&args.store) {
        Ok(opened) => opened,
        Err(code) => return code,
    };

    let events = match store.recent_audit(event_type, args.limit) {
        Ok(events) => events,
        Err(e) => return fail("Failed to read audit log", e),
    };

    if args.json {
        if let Err(code) = output::emit_json(&events) {
            return code;
        }
        return exit_codes::SUCCESS;
    }

    for event in &events {
        let mut line = format!(
            "{}  {:<24}",
            output::format_us(event.timestamp_us),
            event.event_type.as_str()
        );
        if let Some(session) = event.session_id {
            line.push_str(&format!("  session={}", session));
        }
        if event.old_value.is_some() || event.new_value.is_some() {
            line.push_str(&format!(
                "  {} -> {}",
                event.old_value.as_deref().unwrap_or("-"),
                event.new_value.as_deref().unwrap_or("-")
            ));
        }
        if let Some(details) = &event.details {
            line.push_str(&format!("  {}", details));
        }
        println!("{}", line);
    }

    exit_codes::SUCCESS
}
