//! Console input: slash commands and plain chat lines.

pub const HELP: &str = "\
Available commands:
  /j #room          join or create a room
  /m @user message  send a private message (plaintext, no encryption)
  /w                list online users
  /rooms            show all rooms
  /nick newname     change nickname
  /ping nick        ping a neighbour
  /clear            clear the screen
  /quit             leave the mesh
  /help             show this help";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Input {
    Empty,
    Chat(String),
    Help,
    Join(String),
    Nick(String),
    Private { target: String, text: String },
    Who,
    Rooms,
    Ping(String),
    Clear,
    Quit,
    Usage(&'static str),
    Unknown(String),
}

pub fn parse(line: &str) -> Input {
    let line = line.trim();
    if line.is_empty() {
        return Input::Empty;
    }
    if !line.starts_with('/') {
        return Input::Chat(line.to_string());
    }
    let parts: Vec<&str> = line.split_whitespace().collect();
    let cmd = parts[0].to_lowercase();
    match cmd.as_str() {
        "/help" | "/h" => Input::Help,
        "/j" | "/join" => match parts.get(1) {
            Some(room) => {
                let room = room.trim_start_matches('#');
                if room.is_empty() {
                    Input::Usage("/j #roomname")
                } else {
                    Input::Join(room.to_string())
                }
            }
            None => Input::Usage("/j #roomname"),
        },
        "/nick" | "/nickname" => {
            if parts.len() > 1 {
                Input::Nick(parts[1..].join(" "))
            } else {
                Input::Usage("/nick newname")
            }
        }
        "/m" | "/msg" => {
            if parts.len() > 2 {
                Input::Private {
                    target: parts[1].trim_start_matches('@').to_string(),
                    text: parts[2..].join(" "),
                }
            } else {
                Input::Usage("/m @username message")
            }
        }
        "/w" | "/who" => Input::Who,
        "/rooms" => Input::Rooms,
        "/ping" => match parts.get(1) {
            Some(nick) => Input::Ping(nick.trim_start_matches('@').to_string()),
            None => Input::Usage("/ping nickname"),
        },
        "/clear" => Input::Clear,
        "/quit" | "/q" => Input::Quit,
        _ => Input::Unknown(cmd),
    }
}

/// Private messages carry no recipient field on the wire; the addressee is
/// prefixed to the (plaintext) content.
pub fn private_content(target: &str, text: &str) -> String {
    format!("@{target} {text}")
}
