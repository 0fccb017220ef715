use std::fmt;

use serde::Deserialize;

/// Form body of `POST /start-server`.
///
/// Only the fields below are ever forwarded to the server executable; any
/// other form field is dropped by deserialization.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct StartServerForm {
    #[serde(rename = "saveName")]
    pub save_name: Option<String>,
    #[serde(rename = "latencyMS")]
    pub latency_ms: Option<String>,
    #[serde(rename = "autosaveInterval")]
    pub autosave_interval: Option<String>,
    #[serde(rename = "autosaveSlots")]
    pub autosave_slots: Option<String>,
    pub port: Option<String>,

    #[serde(rename = "disallowCommands")]
    pub disallow_commands: Option<String>,
    #[serde(rename = "peerToPeer")]
    pub peer_to_peer: Option<String>,
    #[serde(rename = "noAutoPause")]
    pub no_auto_pause: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ValueKind {
    SaveName,
    Count,
    Port,
}

struct ValueArg {
    field: &'static str,
    flag: &'static str,
    kind: ValueKind,
}

struct FlagArg {
    field: &'static str,
    flag: &'static str,
}

// Argument order on the command line follows these tables.
const VALUE_ARGS: &[ValueArg] = &[
    ValueArg {
        field: "saveName",
        flag: "--start-server",
        kind: ValueKind::SaveName,
    },
    ValueArg {
        field: "latencyMS",
        flag: "--latency-ms",
        kind: ValueKind::Count,
    },
    ValueArg {
        field: "autosaveInterval",
        flag: "--autosave-interval",
        kind: ValueKind::Count,
    },
    ValueArg {
        field: "autosaveSlots",
        flag: "--autosave-slots",
        kind: ValueKind::Count,
    },
    ValueArg {
        field: "port",
        flag: "--port",
        kind: ValueKind::Port,
    },
];

const FLAG_ARGS: &[FlagArg] = &[
    FlagArg {
        field: "disallowCommands",
        flag: "--disallow-commands",
    },
    FlagArg {
        field: "peerToPeer",
        flag: "--peer-to-peer",
    },
    FlagArg {
        field: "noAutoPause",
        flag: "--no-auto-pause",
    },
];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InvalidStartArgs {
    pub field: &'static str,
    pub reason: String,
}

impl fmt::Display for InvalidStartArgs {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.reason)
    }
}

impl std::error::Error for InvalidStartArgs {}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StartArgs {
    pub argv: Vec<String>,
    pub save_name: String,
    /// Port passed with `--port`, if any.
    pub port: Option<u16>,
}

fn present(v: Option<&String>) -> Option<&str> {
    v.map(|s| s.trim()).filter(|s| !s.is_empty())
}

fn is_truthy(v: &str) -> bool {
    !matches!(
        v.trim().to_ascii_lowercase().as_str(),
        "" | "0" | "false" | "no" | "off"
    )
}

fn validate(arg: &ValueArg, value: &str) -> Result<(), InvalidStartArgs> {
    let invalid = |reason: &str| InvalidStartArgs {
        field: arg.field,
        reason: format!("{} {reason}", arg.field),
    };
    match arg.kind {
        ValueKind::SaveName => {
            if value.starts_with('-') {
                return Err(invalid("must not start with '-'"));
            }
        }
        ValueKind::Count => {
            value
                .parse::<u32>()
                .map_err(|_| invalid("must be an unsigned integer"))?;
        }
        ValueKind::Port => {
            let port = value
                .parse::<u16>()
                .map_err(|_| invalid("must be a port number"))?;
            if port == 0 {
                return Err(invalid("must be non-zero"));
            }
        }
    }
    Ok(())
}

impl StartServerForm {
    fn field(&self, name: &str) -> Option<&String> {
        match name {
            "saveName" => self.save_name.as_ref(),
            "latencyMS" => self.latency_ms.as_ref(),
            "autosaveInterval" => self.autosave_interval.as_ref(),
            "autosaveSlots" => self.autosave_slots.as_ref(),
            "port" => self.port.as_ref(),
            "disallowCommands" => self.disallow_commands.as_ref(),
            "peerToPeer" => self.peer_to_peer.as_ref(),
            "noAutoPause" => self.no_auto_pause.as_ref(),
            _ => None,
        }
    }

    /// Validate the whitelisted fields and build the server's argv.
    pub fn translate(&self) -> Result<StartArgs, InvalidStartArgs> {
        let save_name = present(self.save_name.as_ref())
            .ok_or_else(|| InvalidStartArgs {
                field: "saveName",
                reason: "You must specify a save name".to_string(),
            })?
            .to_string();

        let mut argv = Vec::new();
        for arg in VALUE_ARGS {
            let Some(value) = present(self.field(arg.field)) else {
                continue;
            };
            validate(arg, value)?;
            argv.push(arg.flag.to_string());
            argv.push(value.to_string());
        }
        for flag in FLAG_ARGS {
            if self.field(flag.field).is_some_and(|v| is_truthy(v)) {
                tracing::trace!(field = flag.field, "start flag set");
                argv.push(flag.flag.to_string());
            }
        }

        // Already validated above.
        let port = present(self.port.as_ref()).and_then(|p| p.parse::<u16>().ok());

        Ok(StartArgs {
            argv,
            save_name,
            port,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // Same decoding axum's `Form` extractor applies to the request body.
    fn form(body: &str) -> StartServerForm {
        serde_urlencoded::from_str(body).unwrap()
    }

    #[test]
    fn builds_argv_in_whitelist_order() {
        let args = form("disallowCommands=true&port=12345&saveName=foo")
            .translate()
            .unwrap();
        assert_eq!(
            args.argv,
            vec!["--start-server", "foo", "--port", "12345", "--disallow-commands"]
        );
        assert_eq!(args.save_name, "foo");
        assert_eq!(args.port, Some(12345));
    }

    #[test]
    fn all_fields_follow_declared_order() {
        let args = form(
            "noAutoPause=on&peerToPeer=on&disallowCommands=on&port=34200&autosaveSlots=3\
             &autosaveInterval=10&latencyMS=100&saveName=base",
        )
        .translate()
        .unwrap();
        assert_eq!(
            args.argv,
            vec![
                "--start-server",
                "base",
                "--latency-ms",
                "100",
                "--autosave-interval",
                "10",
                "--autosave-slots",
                "3",
                "--port",
                "34200",
                "--disallow-commands",
                "--peer-to-peer",
                "--no-auto-pause",
            ]
        );
    }

    #[test]
    fn absent_empty_and_unknown_fields_emit_nothing() {
        let args = form("saveName=foo&latencyMS=&rmrf=--yes&peerToPeer=")
            .translate()
            .unwrap();
        assert_eq!(args.argv, vec!["--start-server", "foo"]);
        assert_eq!(args.port, None);
    }

    #[test]
    fn falsy_flag_values_are_not_emitted() {
        let args = form("saveName=foo&disallowCommands=false&noAutoPause=0&peerToPeer=off")
            .translate()
            .unwrap();
        assert_eq!(args.argv, vec!["--start-server", "foo"]);
    }

    #[test]
    fn missing_save_name_is_rejected() {
        let err = form("port=12345").translate().unwrap_err();
        assert_eq!(err.field, "saveName");
        assert_eq!(err.reason, "You must specify a save name");
    }

    #[test]
    fn invalid_values_are_rejected() {
        let err = form("saveName=foo&port=99999").translate().unwrap_err();
        assert_eq!(err.field, "port");
        assert_eq!(err.to_string(), "port must be a port number");
        assert_eq!(
            form("saveName=foo&port=0").translate().unwrap_err().field,
            "port"
        );
        assert_eq!(
            form("saveName=foo&autosaveSlots=many")
                .translate()
                .unwrap_err()
                .field,
            "autosaveSlots"
        );
        assert_eq!(
            form("saveName=--create").translate().unwrap_err().field,
            "saveName"
        );
    }

    #[test]
    fn percent_encoded_values_are_decoded_before_validation() {
        let args = form("saveName=my+base&disallowCommands=on").translate().unwrap();
        assert_eq!(args.argv, vec!["--start-server", "my base", "--disallow-commands"]);

        let err = form("saveName=%2D%2Dcreate").translate().unwrap_err();
        assert_eq!(err.field, "saveName");
        assert_eq!(err.to_string(), "saveName must not start with '-'");
    }
}
