use anyhow::{anyhow, bail, Result};
use horus_device::{Action, ClientCommand};

/// Commands answered from the front end's own view of the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LocalCommand {
    Status,
    Peers,
    Help,
    Quit,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Input {
    Client(ClientCommand),
    Local(LocalCommand),
    Empty,
}

pub const HELP: &str = "\
Commands:
  status                               show the last known device status
  refresh                              ask the device for a fresh status
  set <tpd> <duration> <dir> [action]  apply settings (dir: forward|backward|both)
  start | stop | reset                 motor action with the current settings
  peers                                list other Horus devices
  peer <name> <start|stop|reset>       control one other device
  all <start|stop|reset>               control every other device
  add <name>                           register another device by mDNS name
  ota                                  check for a firmware update
  scan                                 scan for Wi-Fi networks
  wifi <ssid> [password]               save Wi-Fi credentials
  name <name>                          set the device name
  name-reset                           go back to the default name
  help | quit";

pub fn parse(line: &str) -> Result<Input> {
    let parts: Vec<&str> = line.split_whitespace().collect();
    let Some((&command, args)) = parts.split_first() else {
        return Ok(Input::Empty);
    };

    let input = match command.to_lowercase().as_str() {
        "status" => Input::Local(LocalCommand::Status),
        "peers" | "devices" => Input::Local(LocalCommand::Peers),
        "help" | "?" => Input::Local(LocalCommand::Help),
        "quit" | "exit" => Input::Local(LocalCommand::Quit),
        "refresh" => Input::Client(ClientCommand::RequestStatus),
        "ota" => Input::Client(ClientCommand::CheckOta),
        "scan" => Input::Client(ClientCommand::ScanNetworks),
        "name-reset" => Input::Client(ClientCommand::ResetDeviceName),
        "start" | "stop" | "reset" => Input::Client(ClientCommand::Motor(action(command)?)),
        "set" => {
            let [tpd, duration, direction, rest @ ..] = args else {
                bail!("usage: set <tpd> <duration> <dir> [start|stop|reset]");
            };
            let action = match rest {
                [] => None,
                [a] => Some(action(a)?),
                _ => bail!("usage: set <tpd> <duration> <dir> [start|stop|reset]"),
            };
            Input::Client(ClientCommand::ApplySettings {
                turns_per_day: number("turns per day", tpd)?,
                turn_duration: number("turn duration", duration)?,
                direction: direction.to_string(),
                action,
            })
        }
        "peer" => {
            let [peer, a] = args else {
                bail!("usage: peer <name> <start|stop|reset>");
            };
            Input::Client(ClientCommand::ControlPeer {
                peer: strip_local(peer).to_string(),
                action: action(a)?,
            })
        }
        "all" => {
            let [a] = args else {
                bail!("usage: all <start|stop|reset>");
            };
            Input::Client(ClientCommand::ControlAllPeers(action(a)?))
        }
        "add" => {
            let [peer] = args else {
                bail!("usage: add <name>");
            };
            Input::Client(ClientCommand::AddPeer(strip_local(peer).to_string()))
        }
        "wifi" => match args {
            [ssid] => Input::Client(ClientCommand::SaveWifi {
                ssid: ssid.to_string(),
                password: String::new(),
            }),
            [ssid, password] => Input::Client(ClientCommand::SaveWifi {
                ssid: ssid.to_string(),
                password: password.to_string(),
            }),
            _ => bail!("usage: wifi <ssid> [password]"),
        },
        "name" => {
            if args.is_empty() {
                bail!("usage: name <name>");
            }
            Input::Client(ClientCommand::SaveDeviceName(args.join(" ")))
        }
        other => bail!("unknown command '{other}', type 'help'"),
    };
    Ok(input)
}

fn action(token: &str) -> Result<Action> {
    token.parse().map_err(|e| anyhow!("{e}"))
}

fn number(what: &str, token: &str) -> Result<i64> {
    token
        .parse()
        .map_err(|_| anyhow!("{what} must be a number, got '{token}'"))
}

/// Accepts `horus-1.local` as well as `horus-1`.
fn strip_local(name: &str) -> &str {
    name.strip_suffix(".local").unwrap_or(name)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_with_action() {
        let input = parse("set 5 30 Both start").unwrap();
        assert_eq!(
            input,
            Input::Client(ClientCommand::ApplySettings {
                turns_per_day: 5,
                turn_duration: 30,
                direction: "Both".to_string(),
                action: Some(Action::Start),
            })
        );
    }

    #[test]
    fn set_requires_three_values() {
        assert!(parse("set 5 30").is_err());
        assert!(parse("set five 30 both").is_err());
        assert!(parse("set 5 30 both jump").is_err());
    }

    #[test]
    fn peer_names_accept_local_suffix() {
        let input = parse("peer horus-AB12.local stop").unwrap();
        assert_eq!(
            input,
            Input::Client(ClientCommand::ControlPeer {
                peer: "horus-AB12".to_string(),
                action: Action::Stop,
            })
        );
        assert_eq!(
            parse("add horus-9").unwrap(),
            Input::Client(ClientCommand::AddPeer("horus-9".to_string()))
        );
    }

    #[test]
    fn local_and_empty_lines() {
        assert_eq!(parse("   ").unwrap(), Input::Empty);
        assert_eq!(parse("STATUS").unwrap(), Input::Local(LocalCommand::Status));
        assert_eq!(parse("quit").unwrap(), Input::Local(LocalCommand::Quit));
        assert!(parse("dance").is_err());
    }

    #[test]
    fn name_keeps_spaces() {
        assert_eq!(
            parse("name Kitchen Grill").unwrap(),
            Input::Client(ClientCommand::SaveDeviceName("Kitchen Grill".to_string()))
        );
    }
}
