use std::thread;

use fanotify_watcher::{PermissionMode, Watcher};

/// Deny access to paths containing any of these fragments; allow the rest.
const DENIED_FRAGMENTS: &[&str] = &["secret", "shadow"];

fn main() -> Result<(), Box<dyn std::error::Error>> {
    simple_logger::SimpleLogger::new()
        .with_level(log::LevelFilter::Info)
        .init()?;

    let path = std::env::args().nth(1).unwrap_or_else(|| "/tmp".to_string());

    println!("Gating file access under {path}. Press Ctrl+C to stop.");

    let watcher = Watcher::new(PermissionMode::PreContent)?;
    watcher.add(&path)?;

    let errors = watcher.errors();
    thread::spawn(move || {
        for err in errors {
            eprintln!("watcher error: {err}");
        }
    });

    let mut allowed = 0u64;
    let mut denied = 0u64;
    for request in watcher.permission_events() {
        let path_str = request.path.to_string_lossy().into_owned();
        let block = DENIED_FRAGMENTS.iter().any(|frag| path_str.contains(frag));

        println!(
            "{} from pid {} -> {}",
            request,
            request.pid,
            if block { "DENY" } else { "ALLOW" }
        );

        if block {
            denied += 1;
            request.deny()?;
        } else {
            allowed += 1;
            request.allow()?;
        }

        if (allowed + denied) % 100 == 0 {
            println!("decisions so far: {allowed} allowed, {denied} denied");
        }
    }

    Ok(())
}
