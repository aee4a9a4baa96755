use std::io::{self, Write};

pub const EXIT: u32 = 5;

pub fn show_menu() -> io::Result<()> {
    println!("\n===========================================");
    println!("Breath Tracking Toolbox");
    println!("===========================================");
    println!("Select an option:");
    println!("1. Run Session (simulated belt)");
    println!("2. Stream Belt (5 s, newest sample per frame)");
    println!("3. Preview Condition Waveform");
    println!("4. Validate Config");
    println!("5. Exit");
    println!("===========================================");
    print!("Choice (1-5): ");
    io::stdout().flush()
}

/// `None` once stdin is closed.
pub fn get_user_choice() -> io::Result<Option<u32>> {
    let mut input = String::new();
    if io::stdin().read_line(&mut input)? == 0 {
        return Ok(None);
    }
    Ok(Some(input.trim().parse::<u32>().unwrap_or(0)))
}

pub fn prompt(label: &str) -> io::Result<String> {
    print!("{label}");
    io::stdout().flush()?;
    let mut input = String::new();
    io::stdin().read_line(&mut input)?;
    Ok(input.trim().to_string())
}

pub fn wait_for_enter() -> io::Result<()> {
    println!("\nPress Enter to return to menu...");
    let mut input = String::new();
    io::stdin().read_line(&mut input)?;
    Ok(())
}
