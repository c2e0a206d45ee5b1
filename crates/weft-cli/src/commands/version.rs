//! Version command implementation.

const VERSION: &str = env!("CARGO_PKG_VERSION");

pub fn run() {
    println!("weft {VERSION}");
    println!();
    println!("Build info:");
    println!("  Target:       {}", std::env::consts::ARCH);
    println!("  OS:           {}", std::env::consts::OS);
    println!(
        "  Reactor:      {} (auto)",
        weft_reactor::ReactorKind::Auto.resolve()
    );
}
