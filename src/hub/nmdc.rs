//! NMDC protocol adaptor.
//!
//! Dollar-prefixed, pipe-terminated commands. Users are nick-addressed, so
//! the adaptor synthesises short ids and keeps the nick mapping; the session
//! sees the same event set as ADC.

use std::collections::HashMap;

use crate::share::SearchQuery;
use crate::tth::Tth;
use crate::types::ChatMessage;

use super::search_queue::PendingSearch;
use super::user::Identity;
use super::{ProtocolAdaptor, ProtocolEvent};

/// Replace NMDC-reserved characters in chat payloads
fn escape(s: &str) -> String {
    s.replace('$', "&#36;").replace('|', "&#124;")
}

/// Undo NMDC character references
fn unescape(s: &str) -> String {
    s.replace("&#36;", "$").replace("&#124;", "|")
}

/// The classic lock-to-key transformation
fn lock_to_key(lock: &str) -> String {
    let lock = lock.as_bytes();
    if lock.len() < 3 {
        return String::new();
    }
    let mut key = vec![0u8; lock.len()];
    for i in 1..lock.len() {
        key[i] = lock[i] ^ lock[i - 1];
    }
    key[0] = lock[0] ^ lock[lock.len() - 1] ^ lock[lock.len() - 2] ^ 5;
    let mut out = String::new();
    for byte in key {
        let nibble_swapped = ((byte << 4) & 0xF0) | ((byte >> 4) & 0x0F);
        match nibble_swapped {
            0 | 5 | 36 | 96 | 124 | 126 => {
                out.push_str(&format!("/%DCN{nibble_swapped:03}%/"));
            }
            other => out.push(other as char),
        }
    }
    out
}

/// The NMDC dialect
pub struct NmdcProtocol {
    own_nick: String,
    next_sid: u32,
    sids: HashMap<String, u32>,
}

impl NmdcProtocol {
    /// Create an adaptor for the given nick
    pub fn new(nick: &str) -> Self {
        Self {
            own_nick: nick.to_string(),
            next_sid: 1,
            sids: HashMap::new(),
        }
    }

    fn sid_for(&mut self, nick: &str) -> u32 {
        if let Some(sid) = self.sids.get(nick) {
            return *sid;
        }
        let sid = self.next_sid;
        self.next_sid += 1;
        self.sids.insert(nick.to_string(), sid);
        sid
    }

    fn my_info(&self, identity: &Identity) -> String {
        format!(
            "$MyINFO $ALL {} {}$ $100\u{1}$$ {}$",
            self.own_nick,
            escape(&identity.description),
            identity.share_size,
        )
    }

    fn parse_search(&mut self, rest: &str) -> Option<ProtocolEvent> {
        // $Search <ip>:<port> F?T?0?9?TTH:<tth>   (or Hub:<nick> for passive)
        let (origin, criteria) = rest.split_once(' ')?;
        let ip = origin
            .strip_prefix("Hub:")
            .map(|nick| format!("nick:{nick}"))
            .unwrap_or_else(|| origin.split(':').next().unwrap_or(origin).to_string());

        let parts: Vec<&str> = criteria.splitn(5, '?').collect();
        if parts.len() != 5 {
            return None;
        }
        let mut query = SearchQuery::default();
        let size: Option<u64> = parts[2].parse().ok();
        match (parts[0], parts[1]) {
            ("T", "F") => query.min_size = size,
            ("T", "T") => query.max_size = size,
            _ => {}
        }
        if parts[3] == "9" {
            query.tth = parts[4].strip_prefix("TTH:").and_then(Tth::from_base32);
        } else {
            query.include = parts[4]
                .split('$')
                .filter(|t| !t.is_empty())
                .map(unescape)
                .collect();
        }
        Some(ProtocolEvent::Search {
            sid: None,
            ip,
            query,
            token: String::new(),
        })
    }

    fn parse_result(&mut self, rest: &str) -> Option<ProtocolEvent> {
        // $SR <nick> <path>\x05<size> <free>/<total>\x05TTH:<tth> (<hubip>)
        let (nick, tail) = rest.split_once(' ')?;
        let mut sections = tail.split('\u{5}');
        let path = sections.next()?.to_string();
        let size_slots = sections.next()?;
        let (size, slots) = size_slots.split_once(' ')?;
        let free_slots = slots.split('/').next().unwrap_or("0");
        let tth = sections
            .next()
            .and_then(|s| s.split(' ').next())
            .and_then(|s| s.strip_prefix("TTH:"))
            .and_then(Tth::from_base32);

        Some(ProtocolEvent::SearchResult {
            cid: None,
            nick: nick.to_string(),
            path: unescape(&path),
            size: size.parse().ok()?,
            slots: free_slots.parse().unwrap_or(0),
            tth,
            token: String::new(),
        })
    }

    fn parse_my_info(&mut self, rest: &str) -> Option<ProtocolEvent> {
        // $ALL <nick> <description>$ $<speed><flag>$<email>$<share>$
        let rest = rest.strip_prefix("$ALL ")?;
        let (nick, tail) = rest.split_once(' ')?;
        let mut sections = tail.split('$');
        let description = sections.next().unwrap_or("").to_string();
        let _ = sections.next();
        let _speed = sections.next();
        let _email = sections.next();
        let share_size = sections
            .next()
            .and_then(|s| s.trim().parse().ok())
            .unwrap_or(0);

        let sid = self.sid_for(nick);
        Some(ProtocolEvent::UserUpdated {
            sid,
            identity: Identity {
                nick: nick.to_string(),
                description: unescape(&description),
                share_size,
                ..Identity::default()
            },
        })
    }
}

impl ProtocolAdaptor for NmdcProtocol {
    fn initial_lines(&mut self, _identity: &Identity) -> Vec<String> {
        // NMDC speaks only after the hub's $Lock.
        Vec::new()
    }

    fn send_info(&mut self, identity: &Identity) -> Vec<String> {
        vec![self.my_info(identity)]
    }

    fn send_search(&mut self, search: &PendingSearch) -> Vec<String> {
        let criteria = match &search.query.tth {
            Some(tth) => format!("F?T?0?9?TTH:{tth}"),
            None => format!("F?T?0?1?{}", escape(&search.query.include.join("$"))),
        };
        vec![format!("$Search Hub:{} {}", self.own_nick, criteria)]
    }

    fn send_password(&mut self, password: &str) -> Vec<String> {
        vec![format!("$MyPass {password}")]
    }

    fn send_message(&mut self, text: &str, third_person: bool) -> Vec<String> {
        if third_person {
            vec![format!("* {} {}", self.own_nick, escape(text))]
        } else {
            vec![format!("<{}> {}", self.own_nick, escape(text))]
        }
    }

    fn parse_line(&mut self, line: &str) -> Vec<ProtocolEvent> {
        // Main chat lines are "<nick> text"; everything else is $-prefixed.
        if let Some(rest) = line.strip_prefix('<')
            && let Some((nick, text)) = rest.split_once("> ")
        {
            return vec![ProtocolEvent::ChatMessage(ChatMessage {
                from: nick.to_string(),
                text: unescape(text),
                third_person: false,
                private: false,
                time: chrono::Utc::now(),
                read: false,
            })];
        }

        let Some(command) = line.strip_prefix('$') else {
            return Vec::new();
        };
        let (name, rest) = command.split_once(' ').unwrap_or((command, ""));

        match name {
            "Lock" => {
                let lock = rest.split(" Pk=").next().unwrap_or(rest);
                vec![
                    ProtocolEvent::Reply(
                        "$Supports NoGetINFO NoHello UserIP2 TTHSearch UserCommand".to_string(),
                    ),
                    ProtocolEvent::Reply(format!("$Key {}", lock_to_key(lock))),
                    ProtocolEvent::Reply(format!("$ValidateNick {}", self.own_nick)),
                    ProtocolEvent::Handshaken,
                ]
            }
            "Supports" | "HubName" | "UserIP" | "HubTopic" => Vec::new(),
            "Hello" => {
                let nick = rest.trim();
                if nick == self.own_nick {
                    let identity = Identity {
                        nick: nick.to_string(),
                        ..Identity::default()
                    };
                    vec![
                        ProtocolEvent::Reply("$Version 1,0091".to_string()),
                        ProtocolEvent::Reply("$GetNickList".to_string()),
                        ProtocolEvent::LoggedIn(identity),
                    ]
                } else {
                    let sid = self.sid_for(nick);
                    vec![ProtocolEvent::UserUpdated {
                        sid,
                        identity: Identity {
                            nick: nick.to_string(),
                            ..Identity::default()
                        },
                    }]
                }
            }
            "GetPass" => vec![ProtocolEvent::Password],
            "BadPass" => vec![ProtocolEvent::Failed("password refused".into())],
            "ForceMove" => vec![ProtocolEvent::Redirect(rest.trim().to_string())],
            "Quit" => {
                let nick = rest.trim();
                match self.sids.remove(nick) {
                    Some(sid) => vec![ProtocolEvent::UserQuit(sid)],
                    None => Vec::new(),
                }
            }
            "MyINFO" => self.parse_my_info(rest).into_iter().collect(),
            "NickList" => rest
                .split("$$")
                .filter(|n| !n.is_empty() && *n != self.own_nick)
                .map(|n| n.to_string())
                .collect::<Vec<_>>()
                .into_iter()
                .map(|nick| {
                    let sid = self.sid_for(&nick);
                    ProtocolEvent::UserUpdated {
                        sid,
                        identity: Identity {
                            nick,
                            ..Identity::default()
                        },
                    }
                })
                .collect(),
            "OpList" => rest
                .split("$$")
                .filter(|n| !n.is_empty())
                .map(|nick| {
                    let sid = self.sid_for(nick);
                    ProtocolEvent::UserUpdated {
                        sid,
                        identity: Identity {
                            nick: nick.to_string(),
                            operator: true,
                            ..Identity::default()
                        },
                    }
                })
                .collect(),
            "To:" => {
                // $To: <me> From: <nick> $<<nick>> text
                let Some((_, from_part)) = rest.split_once("From: ") else {
                    return Vec::new();
                };
                let Some((nick, text)) = from_part.split_once(" $") else {
                    return Vec::new();
                };
                let body = text
                    .strip_prefix(&format!("<{nick}> "))
                    .unwrap_or(text)
                    .to_string();
                vec![ProtocolEvent::PrivateMessage(ChatMessage {
                    from: nick.to_string(),
                    text: unescape(&body),
                    third_person: false,
                    private: true,
                    time: chrono::Utc::now(),
                    read: false,
                })]
            }
            "Search" => self.parse_search(rest).into_iter().collect(),
            "SR" => self.parse_result(rest).into_iter().collect(),
            "ConnectToMe" => {
                // $ConnectToMe <me> <ip>:<port>
                let Some((_, address)) = rest.rsplit_once(' ') else {
                    return Vec::new();
                };
                let Some((ip, port)) = address.split_once(':') else {
                    return Vec::new();
                };
                let Ok(port) = port.trim_end_matches(|c: char| !c.is_ascii_digit()).parse()
                else {
                    return Vec::new();
                };
                vec![ProtocolEvent::Ctm {
                    ip: ip.to_string(),
                    port,
                    token: String::new(),
                    sid: None,
                }]
            }
            "RevConnectToMe" => {
                let nick = rest.split(' ').next().unwrap_or("");
                let sid = self.sid_for(nick);
                vec![ProtocolEvent::Rcm {
                    sid: Some(sid),
                    token: String::new(),
                }]
            }
            other => {
                tracing::trace!(command = other, "ignored NMDC command");
                Vec::new()
            }
        }
    }

    fn separator(&self) -> u8 {
        b'|'
    }
}
