// Short-lived process for the procevents end-to-end tests: it is exec'd,
// lives for a known time, then exits, producing one exec and one exit record.
//
// usage: exit_helper [lifetime_ms] [exit_status]

use std::env;
use std::process;
use std::thread;
use std::time::Duration;

fn arg_or<T: std::str::FromStr>(index: usize, default: T) -> T {
    match env::args().nth(index) {
        Some(raw) => match raw.parse() {
            Ok(value) => value,
            Err(_) => {
                eprintln!("exit_helper: invalid argument '{}'", raw);
                process::exit(2);
            }
        },
        None => default,
    }
}

fn main() {
    let lifetime_ms: u64 = arg_or(1, 200);
    let status: i32 = arg_or(2, 0);

    println!("exit_helper pid {} living {}ms", process::id(), lifetime_ms);
    thread::sleep(Duration::from_millis(lifetime_ms));
    process::exit(status);
}
