//! Demo client: submit the same bytes three ways and watch them collapse.
//!
//! Run `uniqued --verbose` in another terminal to see the daemon's view:
//! one blob, three handles, apparent size three times the real size.

use std::time::Duration;
use uniqued::Unique;

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("uniqued=debug")),
        )
        .with_writer(std::io::stderr)
        .init();

    let unique = Unique::session();
    if !unique.is_connected() {
        eprintln!("unique-demo: no daemon, buffers will be plain copies");
    }

    let payload = b"Hello, World!\0";

    let data1 = unique.bytes_sync(payload);
    println!("data1: {:p} {:?}", data1.as_ptr(), text(&data1));

    let data2 = unique.bytes_sync(payload);
    println!("data2: {:p} {:?}", data2.as_ptr(), text(&data2));

    let data3 = unique.bytes_async(payload);
    println!("data3: {:p} {:?}", data3.as_ptr(), text(&data3));

    std::thread::sleep(Duration::from_secs(1));
    println!("destroying data1");
    drop(data1);

    std::thread::sleep(Duration::from_secs(1));
    println!("destroying data2");
    drop(data2);

    // Pick up the async reply; data3's pages now come from the daemon's
    // canonical copy, at the same address as before.
    unique.dispatch(Some(Duration::from_secs(1)));
    println!("data3 after dispatch: {:p} {:?}", data3.as_ptr(), text(&data3));

    std::thread::sleep(Duration::from_secs(1));
    println!("destroying data3");
    drop(data3);
}

fn text(bytes: &[u8]) -> &str {
    std::str::from_utf8(bytes)
        .map(|s| s.trim_end_matches('\0'))
        .unwrap_or("<binary>")
}
