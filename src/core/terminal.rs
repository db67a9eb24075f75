use console::{Emoji, style};

pub static SUCCESS_ICON: Emoji<'_, '_> = Emoji("✅ ", "");
pub static INFO_ICON: Emoji<'_, '_> = Emoji("ℹ️  ", "");
pub static WARN_ICON: Emoji<'_, '_> = Emoji("⚠️  ", "");
pub static ERROR_ICON: Emoji<'_, '_> = Emoji("❌ ", "");
pub static GLOBE: Emoji<'_, '_> = Emoji("🌐 ", "");
pub static GEAR: Emoji<'_, '_> = Emoji("⚙️  ", "");
pub static SPARKLE: Emoji<'_, '_> = Emoji("✨ ", "");

pub fn print_success(msg: &str) {
    println!("{} {}", SUCCESS_ICON, style(msg).green());
}

pub fn print_info(msg: &str) {
    println!("{} {}", INFO_ICON, style(msg).blue());
}

pub fn print_warn(msg: &str) {
    println!("{} {}", WARN_ICON, style(msg).yellow());
}

pub fn print_error(msg: &str) {
    eprintln!("{} {}", ERROR_ICON, style(msg).red().bold());
}

pub fn print_status(label: &str, msg: &str) {
    println!("  {} {}: {}", GEAR, style(label).bold().cyan(), msg);
}

pub fn print_link(label: &str, url: &str) {
    println!(
        "  {} {}: {}",
        GLOBE,
        style(label).bold(),
        style(url).underlined().cyan()
    );
}

pub fn print_banner() {
    let lines: &[&str] = &[
        "                     _            _             ",
        "  ___ ___  _ __   __| |_   _  ___| |_ ___  _ __ ",
        " / __/ _ \\| '_ \\ / _` | | | |/ __| __/ _ \\| '__|",
        "| (_| (_) | | | | (_| | |_| | (__| || (_) | |   ",
        " \\___\\___/|_| |_|\\__,_|\\__,_|\\___|\\__\\___/|_|   ",
    ];

    // #f59e0b -> #ef4444 -> #8b5cf6, left to right
    let stops: [(u8, u8, u8); 3] = [(245, 158, 11), (239, 68, 68), (139, 92, 246)];
    let max_w = lines.iter().map(|l| l.len()).max().unwrap_or(1) as u32;

    println!();
    for line in lines {
        for (x, ch) in line.chars().enumerate() {
            if ch == ' ' {
                print!(" ");
                continue;
            }
            let d = (x as u32 * 1000 / max_w).min(1000);
            let (r, g, b) = if d <= 500 {
                lerp_color(stops[0], stops[1], d * 2)
            } else {
                lerp_color(stops[1], stops[2], (d - 500) * 2)
            };
            print!("\x1b[38;2;{};{};{}m{}", r, g, b, ch);
        }
        println!();
    }
    print!("\x1b[0m");

    println!("\x1b[38;2;139;92;246mEvery agent in its lane.\x1b[0m\n");
}

fn lerp_color(a: (u8, u8, u8), b: (u8, u8, u8), t: u32) -> (u8, u8, u8) {
    let mix = |x: u8, y: u8| ((x as u32 * (1000 - t) + y as u32 * t) / 1000) as u8;
    (mix(a.0, b.0), mix(a.1, b.1), mix(a.2, b.2))
}

/// Titled block of aligned `command  description` rows for help screens.
pub struct GuideSection {
    title: String,
    rows: Vec<(String, String)>,
}

impl GuideSection {
    pub fn new(title: &str) -> Self {
        Self {
            title: title.to_string(),
            rows: Vec::new(),
        }
    }

    pub fn command(mut self, name: &str, description: &str) -> Self {
        self.rows.push((name.to_string(), description.to_string()));
        self
    }

    pub fn print(&self) {
        println!(" {}", style(&self.title).bold().underlined());
        let width = self.rows.iter().map(|(n, _)| n.len()).max().unwrap_or(0);
        for (name, description) in &self.rows {
            let padded = format!("{:<width$}", name, width = width);
            println!("   {}  {}", style(padded).green(), style(description).dim());
        }
        println!();
    }
}

pub fn print_goodbye() {
    println!("\n{} {}", SPARKLE, style("Conductor stopped.").bold().cyan());
}
