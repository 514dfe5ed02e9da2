use std::thread;

use fanotify_watcher::{PermissionMode, Watcher};

fn main() -> Result<(), Box<dyn std::error::Error>> {
    simple_logger::SimpleLogger::new()
        .with_level(log::LevelFilter::Info)
        .init()?;

    let path = std::env::args().nth(1).unwrap_or_else(|| "/tmp".to_string());

    println!("Watching {path} for filesystem events. Press Ctrl+C to stop.");

    let watcher = Watcher::new(PermissionMode::None)?;
    watcher.add(&path)?;

    println!(
        "Watcher running on kernel {} with flags {:?}",
        watcher.kernel_version(),
        watcher.init_flags()
    );

    let errors = watcher.errors();
    thread::spawn(move || {
        for err in errors {
            eprintln!("watcher error: {err}");
        }
    });

    let mut count = 0u64;
    for event in watcher.events() {
        count += 1;
        println!("#{count}: {event}");
    }

    Ok(())
}
