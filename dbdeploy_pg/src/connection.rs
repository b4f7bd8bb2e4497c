use dbdeploy_core::prelude::*;
use sqlx::postgres::PgConnectOptions;

/// Database used for server-level statements such as `CREATE DATABASE`.
pub const MAINTENANCE_DATABASE: &str = "postgres";

/// Builds postgres connection options and URLs for deployment endpoints.
///
/// The endpoint's server name is `host` or `host:port`. Integrated
/// authentication leaves user and password to the environment (`PGUSER`,
/// `PGPASSWORD`, `.pgpass`); SQL authentication uses the given login.
#[derive(Debug, Clone, Copy, Default)]
pub struct PgConnectionInfoBuilder;

impl PgConnectionInfoBuilder {
    /// Connection options for `endpoint`.
    pub fn connect_options(
        &self,
        endpoint: &DatabaseEndpoint,
        auth_mode: AuthenticationMode,
        login: Option<&str>,
        password: Option<&str>,
    ) -> PgConnectOptions {
        let (host, port) = split_server(&endpoint.server_name);
        let mut options = PgConnectOptions::new()
            .host(host)
            .database(&endpoint.database_name);
        if let Some(port) = port {
            options = options.port(port);
        }
        if auth_mode == AuthenticationMode::Sql {
            if let Some(login) = login {
                options = options.username(login);
            }
            if let Some(password) = password {
                options = options.password(password);
            }
        }
        options
    }
}

impl ConnectionInfoBuilder for PgConnectionInfoBuilder {
    fn build_connection_string(
        &self,
        endpoint: &DatabaseEndpoint,
        auth_mode: AuthenticationMode,
        login: Option<&str>,
        password: Option<&str>,
    ) -> String {
        let credentials = match (auth_mode, login) {
            (AuthenticationMode::Sql, Some(login)) => match password {
                Some(password) => format!("{}:{}@", encode(login), encode(password)),
                None => format!("{}@", encode(login)),
            },
            _ => String::new(),
        };
        format!(
            "postgres://{credentials}{}/{}",
            endpoint.server_name,
            encode(&endpoint.database_name)
        )
    }
}

fn split_server(server: &str) -> (&str, Option<u16>) {
    match server.rsplit_once(':') {
        Some((host, port)) => match port.parse() {
            Ok(port) => (host, Some(port)),
            Err(_) => (server, None),
        },
        None => (server, None),
    }
}

/// Percent-encodes everything but RFC 3986 unreserved characters.
fn encode(value: &str) -> String {
    let mut encoded = String::with_capacity(value.len());
    for byte in value.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'.' | b'_' | b'~' => {
                encoded.push(byte as char)
            }
            _ => encoded.push_str(&format!("%{byte:02X}")),
        }
    }
    encoded
}
