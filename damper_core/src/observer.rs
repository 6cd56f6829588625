//! Observer fan-out and the inbound command plane.
//!
//! Observers receive one ASCII line per message; the shapes are:
//!
//! | Tag | Meaning |
//! |-----|---------|
//! | `C …<br/>` | console line (entity-escaped) |
//! | `D 0\|1` | active state |
//! | `E s0 s1 s2` | motor speeds |
//! | `B t d0 d1 d2` | historical sample |
//! | `F t [d0 d1 d2 w0 w1 w2 p]` | live sample (short form = missing ADC) |
//!
//! Inbound commands are `cmd[:arg]`; authorization is by source address
//! against the allow-list (`"*"` wildcard).

use std::fmt;

use crossbeam_channel::Sender;

pub type ObserverId = u64;

/// Outbound message, formatted by Display into its wire line.
#[derive(Debug, Clone, PartialEq)]
pub enum OutMsg {
    Console(String),
    Active(bool),
    Speeds([i32; 3]),
    History { seq: u64, vals: [f64; 3] },
    Live { t: u64, vals: Option<[f64; 7]> },
}

impl fmt::Display for OutMsg {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OutMsg::Console(text) => write!(f, "C {}<br/>", escape_entities(text)),
            OutMsg::Active(on) => write!(f, "D {}", u8::from(*on)),
            OutMsg::Speeds([a, b, c]) => write!(f, "E {a} {b} {c}"),
            OutMsg::History { seq, vals } => {
                write!(f, "B {seq} {:.2} {:.2} {:.2}", vals[0], vals[1], vals[2])
            }
            OutMsg::Live { t, vals: None } => write!(f, "F {t}"),
            OutMsg::Live { t, vals: Some(v) } => {
                write!(
                    f,
                    "F {t} {:.2} {:.2} {:.2} {:.2} {:.2} {:.2} {:.2}",
                    v[0], v[1], v[2], v[3], v[4], v[5], v[6]
                )
            }
        }
    }
}

/// Minimal entity escape for console lines shown in a browser.
pub fn escape_entities(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for ch in s.chars() {
        match ch {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            _ => out.push(ch),
        }
    }
    out
}

/// A connected client.
pub struct Observer {
    pub id: ObserverId,
    /// Remote address as `ip:port`.
    pub addr: String,
    pub name: String,
    pub authorized: bool,
    pub verbose: bool,
    tx: Sender<String>,
}

impl Observer {
    pub fn new(id: ObserverId, addr: String, authorized: bool, tx: Sender<String>) -> Self {
        let name = format!("observer-{id}");
        Self {
            id,
            addr,
            name,
            authorized,
            verbose: false,
            tx,
        }
    }

    /// Best-effort send; a slow client drops messages rather than stalling
    /// the engine.
    pub fn send(&self, msg: &OutMsg) {
        let _ = self.tx.try_send(msg.to_string());
    }
}

/// True when `addr` (ip or ip:port) is covered by the allow-list.
pub fn is_allowed(addr: &str, allow: &[String]) -> bool {
    let ip = addr.rsplit_once(':').map_or(addr, |(ip, _)| ip);
    allow.iter().any(|a| a == "*" || a == ip || a == addr)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActiveArg {
    On,
    Off,
    Start,
}

/// Parsed operator command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Help,
    Active(Option<ActiveArg>),
    Cal,
    List,
    Log(String),
    Name(Option<String>),
    Verbose(Option<bool>),
    Who,
    Avr { slot: usize, raw: String },
}

/// Parse `cmd[:arg]`. The command token is case-insensitive; the argument is
/// passed through verbatim (trimmed).
pub fn parse_command(line: &str) -> Result<Command, String> {
    let line = line.trim();
    let (cmd, arg) = match line.split_once(':') {
        Some((c, a)) => (c.trim().to_ascii_lowercase(), Some(a.trim())),
        None => (line.to_ascii_lowercase(), None),
    };
    let arg_nonempty = arg.filter(|a| !a.is_empty());
    match cmd.as_str() {
        "help" => Ok(Command::Help),
        "active" => match arg_nonempty.map(str::to_ascii_lowercase).as_deref() {
            None => Ok(Command::Active(None)),
            Some("on") => Ok(Command::Active(Some(ActiveArg::On))),
            Some("off") => Ok(Command::Active(Some(ActiveArg::Off))),
            Some("start") => Ok(Command::Active(Some(ActiveArg::Start))),
            Some(other) => Err(format!("active: unknown argument '{other}'")),
        },
        "cal" => Ok(Command::Cal),
        "list" => Ok(Command::List),
        "log" => match arg_nonempty {
            Some(msg) => Ok(Command::Log(msg.to_string())),
            None => Err("log: message required".into()),
        },
        "name" => Ok(Command::Name(arg_nonempty.map(str::to_string))),
        "verbose" => match arg_nonempty.map(str::to_ascii_lowercase).as_deref() {
            None => Ok(Command::Verbose(None)),
            Some("on") => Ok(Command::Verbose(Some(true))),
            Some("off") => Ok(Command::Verbose(Some(false))),
            Some(other) => Err(format!("verbose: unknown argument '{other}'")),
        },
        "who" => Ok(Command::Who),
        _ => {
            if let Some(num) = cmd.strip_prefix("avr") {
                let slot = num
                    .parse::<usize>()
                    .map_err(|_| format!("unknown command '{cmd}'"))?;
                let raw = arg_nonempty.ok_or("avr: command required")?.to_string();
                return Ok(Command::Avr { slot, raw });
            }
            Err(format!("unknown command '{cmd}'"))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn messages_format_as_wire_lines() {
        assert_eq!(OutMsg::Active(true).to_string(), "D 1");
        assert_eq!(OutMsg::Speeds([0, -200, 1000]).to_string(), "E 0 -200 1000");
        assert_eq!(
            OutMsg::History {
                seq: 123,
                vals: [1.0, 2.0, 3.0]
            }
            .to_string(),
            "B 123 1.00 2.00 3.00"
        );
        assert_eq!(OutMsg::Live { t: 42, vals: None }.to_string(), "F 42");
        assert_eq!(
            OutMsg::Console("a < b".into()).to_string(),
            "C a &lt; b<br/>"
        );
    }

    #[test]
    fn allow_list_matches_ip_and_wildcard() {
        let allow = vec!["10.0.0.5".to_string()];
        assert!(is_allowed("10.0.0.5:51234", &allow));
        assert!(!is_allowed("10.0.0.6:51234", &allow));
        assert!(is_allowed("10.0.0.6:51234", &["*".to_string()]));
    }

    #[test]
    fn commands_parse_case_insensitive_with_args() {
        assert_eq!(parse_command("HELP"), Ok(Command::Help));
        assert_eq!(
            parse_command("active:START"),
            Ok(Command::Active(Some(ActiveArg::Start)))
        );
        assert_eq!(parse_command("active"), Ok(Command::Active(None)));
        assert_eq!(
            parse_command("log:pump swapped"),
            Ok(Command::Log("pump swapped".into()))
        );
        assert_eq!(
            parse_command("name:cryo shift"),
            Ok(Command::Name(Some("cryo shift".into())))
        );
        assert_eq!(
            parse_command("avr0:m0 stat"),
            Ok(Command::Avr {
                slot: 0,
                raw: "m0 stat".into()
            })
        );
    }

    #[test]
    fn bad_commands_are_rejected_with_text() {
        assert!(parse_command("frobnicate").is_err());
        assert!(parse_command("active:sideways").is_err());
        assert!(parse_command("log").is_err());
        assert!(parse_command("avrx:m0").is_err());
    }
}
