/// Line-oriented control from the terminal.
///
/// Reads stdin on a dedicated OS thread (an interactive stdin read would keep
/// the tokio runtime from shutting down) and forwards parsed commands to the
/// coordinator.

use std::io::BufRead;

use tracing::{info, warn};

use crate::event::{ControlCommand, CoreEvent, CoreSender};
use crate::hotkey::HotkeyAction;

pub const HELP: &str = "\
Commands:
  rebind <up|down|stop>   press a key to bind it to the action
  game <name>             switch game profile
  preset <name>           apply a resolution preset to the active profile
  confidence <0..1>       set the vision match threshold
  debug <on|off>          save the captured region to debug_frame.png
  stop                    cancel the running countdown
  quit                    exit";

/// Parses one console line. `Ok(None)` for blank lines and `help`.
pub fn parse_command(line: &str) -> Result<Option<CoreEvent>, String> {
    let mut words = line.split_whitespace();
    let Some(verb) = words.next() else {
        return Ok(None);
    };
    let rest: Vec<&str> = words.collect();
    let arg = rest.join(" ");

    let command = match verb.to_lowercase().as_str() {
        "help" | "?" => return Ok(None),
        "quit" | "exit" => return Ok(Some(CoreEvent::Shutdown)),
        "stop" | "cancel" => ControlCommand::Cancel,
        "rebind" => {
            let action = HotkeyAction::from_name(&arg)
                .ok_or_else(|| format!("rebind expects up, down or stop (got '{arg}')"))?;
            ControlCommand::Rebind(action)
        }
        "game" => ControlCommand::SwitchGame(require(&arg, "game")?),
        "preset" => ControlCommand::ApplyPreset(require(&arg, "preset")?),
        "confidence" => {
            let value: f32 = arg
                .trim_end_matches('%')
                .parse()
                .map_err(|_| format!("confidence expects a number (got '{arg}')"))?;
            let value = if arg.ends_with('%') { value / 100.0 } else { value };
            if !(0.0..=1.0).contains(&value) {
                return Err(format!("confidence must be between 0 and 1 (got {value})"));
            }
            ControlCommand::SetConfidence(value)
        }
        "debug" => match arg.to_lowercase().as_str() {
            "on" | "true" | "1" => ControlCommand::SetDebug(true),
            "off" | "false" | "0" => ControlCommand::SetDebug(false),
            _ => return Err(format!("debug expects on or off (got '{arg}')")),
        },
        other => return Err(format!("Unknown command '{other}'; type 'help'")),
    };
    Ok(Some(CoreEvent::Command(command)))
}

fn require(arg: &str, verb: &str) -> Result<String, String> {
    if arg.is_empty() {
        Err(format!("{verb} expects a name"))
    } else {
        Ok(arg.to_string())
    }
}

/// Spawns the stdin reader. It exits on EOF or once the coordinator is gone.
pub fn spawn(tx: CoreSender) {
    let spawned = std::thread::Builder::new()
        .name("console".into())
        .spawn(move || {
            info!("Type 'help' for console commands");
            for line in std::io::stdin().lock().lines() {
                let Ok(line) = line else { break };
                match parse_command(&line) {
                    Ok(Some(event)) => {
                        if tx.send(event).is_err() {
                            break;
                        }
                    }
                    Ok(None) if !line.trim().is_empty() => println!("{HELP}"),
                    Ok(None) => {}
                    Err(message) => warn!("[console] {message}"),
                }
            }
        });
    if let Err(e) = spawned {
        warn!("[console] Failed to start console thread: {e}");
    }
}
