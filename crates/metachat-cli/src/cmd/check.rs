//! `metachat check`: validate everything `start` would, without starting.

use crate::backends::build_backends;
use metachat_channels::bridge::{BridgeError, BridgeState};
use metachat_channels::registry::RoomRegistry;
use metachat_types::config::MetachatConfig;

pub fn cmd_check(config: MetachatConfig) -> Result<(), BridgeError> {
    let addr = config.listen_addr()?;
    let backends = build_backends(&config)?;
    let names: Vec<String> = backends.iter().map(|b| b.name().to_string()).collect();
    let state = BridgeState::new(backends, &config.rooms, config.bridge.clone())?;

    println!("Control surface: http://{addr}");
    println!("Backends:        {}", names.join(", "));
    println!();
    print!("{}", room_table(state.registry()));
    println!();
    println!("Configuration OK");
    Ok(())
}

/// Render the room table: one row per chat, room name on the first row only.
fn room_table(registry: &RoomRegistry) -> String {
    if registry.is_empty() {
        return "No rooms configured.\n".to_string();
    }

    let width = registry
        .rooms()
        .map(|r| r.name.len())
        .max()
        .unwrap_or(0)
        .max("ROOM".len());
    let mut out = format!("{:<width$}  CHAT\n", "ROOM");
    for room in registry.rooms() {
        if room.chats.is_empty() {
            out.push_str(&format!("{:<width$}  (no chats)\n", room.name));
        }
        for (i, chat) in room.chats.iter().enumerate() {
            let label = if i == 0 { room.name.as_str() } else { "" };
            out.push_str(&format!("{label:<width$}  {chat}\n"));
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use metachat_types::message::{Chat, Room};

    #[test]
    fn test_room_table() {
        let rooms = vec![
            Room {
                name: "general".to_string(),
                chats: vec![Chat::new("slack", "C1"), Chat::new("telegram", "-100")],
            },
            Room {
                name: "ops".to_string(),
                chats: Vec::new(),
            },
        ];
        let registry = RoomRegistry::build(&rooms, ["slack", "telegram"]).unwrap();
        assert_eq!(
            room_table(&registry),
            "ROOM     CHAT\n\
             general  slack:C1\n\
             \x20        telegram:-100\n\
             ops      (no chats)\n"
        );
    }

    #[test]
    fn test_empty_room_table() {
        let registry = RoomRegistry::build(&[], std::iter::empty::<&str>()).unwrap();
        assert_eq!(room_table(&registry), "No rooms configured.\n");
    }

    #[test]
    fn test_check_reports_missing_port() {
        let err = cmd_check(MetachatConfig::default()).unwrap_err();
        assert!(err.to_string().contains("port"));
    }
}
