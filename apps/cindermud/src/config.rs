//! Runtime configuration: command-line flags in front, environment
//! variables for the knobs that rarely change.

use std::time::Duration;

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

#[derive(Debug, Clone)]
pub struct Config {
    pub port: u16,
    pub data_dir: String,
    /// Tiny two-room world for smoke runs.
    pub mini: bool,
    /// Build the world, report, and exit without opening a socket.
    pub syntax_check: bool,
    /// Skip NPC special activity.
    pub no_specials: bool,
    /// Refuse new mortal logins.
    pub restrict: bool,
    /// Listener fd inherited across a hot restart.
    pub hotboot_fd: Option<i32>,
    pub tick_ms: u64,
    pub small_buf: usize,
    pub large_buf: usize,
    pub max_line: usize,
    pub max_subneg: usize,
    pub page_length: usize,
    /// Seconds a connection may sit at the login prompts.
    pub idle_login_secs: u64,
    /// Seconds a player may idle in game.
    pub idle_play_secs: u64,
    pub admins: Vec<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: 4000,
            data_dir: "lib".to_string(),
            mini: false,
            syntax_check: false,
            no_specials: false,
            restrict: false,
            hotboot_fd: None,
            tick_ms: env_parse("CINDERMUD_TICK_MS", 100),
            small_buf: env_parse("CINDERMUD_SMALL_BUF", 1024),
            large_buf: env_parse("CINDERMUD_LARGE_BUF", 12 * 1024),
            max_line: env_parse("CINDERMUD_MAX_LINE", 512),
            max_subneg: env_parse("CINDERMUD_MAX_SUBNEG", 4096),
            page_length: env_parse("CINDERMUD_PAGE_LENGTH", crate::pager::DEFAULT_PAGE_LENGTH),
            idle_login_secs: env_parse("CINDERMUD_IDLE_LOGIN_SECS", 120),
            idle_play_secs: env_parse("CINDERMUD_IDLE_PLAY_SECS", 28 * 60),
            admins: std::env::var("CINDERMUD_ADMINS")
                .unwrap_or_else(|_| "vesta".to_string())
                .split(',')
                .map(|s| s.trim().to_lowercase())
                .filter(|s| !s.is_empty())
                .collect(),
        }
    }
}

impl Config {
    pub fn tick(&self) -> Duration {
        Duration::from_millis(self.tick_ms.max(1))
    }

    pub fn pulses_per_sec(&self) -> u64 {
        (1000 / self.tick_ms.max(1)).max(1)
    }

    pub fn is_admin(&self, name: &str) -> bool {
        let lower = name.to_lowercase();
        self.admins.iter().any(|a| *a == lower)
    }

    pub fn hotboot_path(&self) -> std::path::PathBuf {
        std::path::Path::new(&self.data_dir).join("hotboot.json")
    }

    /// Parse command-line arguments on top of the defaults. Returns a
    /// usage message on bad input.
    pub fn parse(args: &[String]) -> Result<Config, String> {
        let mut cfg = Config::default();
        let mut it = args.iter();
        let mut port_seen = false;
        while let Some(arg) = it.next() {
            match arg.as_str() {
                "-c" => cfg.syntax_check = true,
                "-m" => cfg.mini = true,
                "-s" => cfg.no_specials = true,
                "-r" => cfg.restrict = true,
                "-d" => {
                    cfg.data_dir = it
                        .next()
                        .ok_or_else(|| "-d requires a directory".to_string())?
                        .clone();
                }
                "-H" => {
                    let raw = it.next().ok_or_else(|| "-H requires an fd".to_string())?;
                    cfg.hotboot_fd =
                        Some(raw.parse().map_err(|_| format!("bad fd for -H: {raw}"))?);
                }
                other if other.starts_with('-') => {
                    return Err(format!("unknown flag: {other}"));
                }
                port => {
                    if port_seen {
                        return Err("port given twice".to_string());
                    }
                    cfg.port = port
                        .parse()
                        .map_err(|_| format!("bad port number: {port}"))?;
                    port_seen = true;
                }
            }
        }
        Ok(cfg)
    }
}

pub fn usage_and_exit(program: &str, err: &str) -> ! {
    eprintln!("error: {err}");
    eprintln!();
    eprintln!("usage: {program} [-c] [-m] [-s] [-r] [-d <dir>] [-H <fd>] [port]");
    eprintln!("  -c        check the world loads, then exit");
    eprintln!("  -m        mini world");
    eprintln!("  -s        no NPC special activity");
    eprintln!("  -r        restrict logins to admins");
    eprintln!("  -d <dir>  data directory (default: lib)");
    eprintln!("  -H <fd>   internal, used by hot restart");
    eprintln!();
    eprintln!("environment:");
    eprintln!("  CINDERMUD_TICK_MS, CINDERMUD_SMALL_BUF, CINDERMUD_LARGE_BUF,");
    eprintln!("  CINDERMUD_MAX_LINE, CINDERMUD_PAGE_LENGTH, CINDERMUD_ADMINS,");
    eprintln!("  CINDERMUD_IDLE_LOGIN_SECS, CINDERMUD_IDLE_PLAY_SECS");
    std::process::exit(2);
}
