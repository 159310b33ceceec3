use bytes::Bytes;

use super::packet::Command;

/// Parsed command from client
#[derive(Debug, Clone)]
pub enum ClientCommand {
    Query(String),
    InitDb(String),
    Quit,
    Ping,
    ResetConnection,
    Unknown(u8, Bytes),
}

impl ClientCommand {
    /// Parse command from packet payload
    pub fn parse(payload: &Bytes) -> Self {
        if payload.is_empty() {
            return ClientCommand::Unknown(0, Bytes::new());
        }

        let cmd = Command::from(payload[0]);
        let data = payload.slice(1..);

        match cmd {
            Command::Query => {
                let sql = String::from_utf8_lossy(&data).to_string();
                ClientCommand::Query(sql)
            }
            Command::InitDb => {
                let db = String::from_utf8_lossy(&data).to_string();
                ClientCommand::InitDb(db)
            }
            Command::Quit => ClientCommand::Quit,
            Command::Ping => ClientCommand::Ping,
            Command::ResetConnection => ClientCommand::ResetConnection,
            _ => ClientCommand::Unknown(payload[0], data),
        }
    }

    /// Check if this command reads without modifying state
    pub fn is_read_only(&self) -> bool {
        match self {
            ClientCommand::Query(sql) => {
                let sql_upper = sql.trim().to_uppercase();
                sql_upper.starts_with("SELECT")
                    || sql_upper.starts_with("SHOW")
                    || sql_upper.starts_with("DESCRIBE")
                    || sql_upper.starts_with("DESC")
                    || sql_upper.starts_with("EXPLAIN")
            }
            ClientCommand::Ping => true,
            _ => false,
        }
    }

}
