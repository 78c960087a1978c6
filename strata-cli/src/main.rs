use anyhow::{Context, Result};
use clap::Parser;
use colored::Colorize;
use reqwest::{RequestBuilder, StatusCode};
use rustyline::DefaultEditor;
use rustyline::error::ReadlineError;
use serde_json::{Value, json};
use std::time::Instant;
use tracing::{error, info};

#[derive(Parser, Debug)]
#[command(name = "strata-cli")]
#[command(about = "Strata CLI - command-line interface for the Strata cache server", long_about = None)]
struct Args {
    /// Server host
    #[arg(short = 'H', long, default_value = "127.0.0.1")]
    host: String,

    /// Server port
    #[arg(short = 'p', long, default_value = "15600")]
    port: u16,

    /// Command to execute (if not in interactive mode)
    #[arg(trailing_var_arg = true)]
    command: Vec<String>,
}

struct StrataClient {
    base_url: String,
    client: reqwest::Client,
}

/// Parse a CLI argument as JSON, falling back to a plain string
fn parse_value(raw: &str) -> Value {
    serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()))
}

/// Session-scoped commands take the session id first
fn split_session<'a>(args: &'a [String], usage: &str) -> Result<(&'a str, &'a [String])> {
    match args.split_first() {
        Some((session, rest)) => Ok((session.as_str(), rest)),
        None => Err(anyhow::anyhow!("Usage: {}", usage)),
    }
}

fn render(value: &Value) -> String {
    match value {
        Value::String(s) => format!("\"{}\"", s),
        other => other.to_string(),
    }
}

impl StrataClient {
    fn new(host: &str, port: u16) -> Self {
        Self {
            base_url: format!("http://{}:{}", host, port),
            client: reqwest::Client::new(),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    /// Send a request and decode the JSON body, turning error statuses into errors
    async fn send(&self, request: RequestBuilder) -> Result<(StatusCode, Value)> {
        let res = request.send().await.context("server unreachable")?;
        let status = res.status();
        let body = res.json::<Value>().await.unwrap_or(Value::Null);

        if (status.is_client_error() && status != StatusCode::NOT_FOUND) || status.is_server_error() {
            return Err(anyhow::anyhow!(
                "{}",
                body["error"].as_str().unwrap_or(status.as_str())
            ));
        }
        Ok((status, body))
    }

    async fn execute_command(&self, command: &str, args: &[String]) -> Result<String> {
        let start = Instant::now();

        let response = match command.to_uppercase().as_str() {
            "SET" => self.cmd_set(None, args).await?,
            "GET" => self.cmd_get(args.get(1).map(String::as_str), args).await?,
            "DEL" | "DELETE" => self.cmd_del(None, args).await?,
            "SSET" => {
                let (session, rest) = split_session(args, "SSET session key value [ttl]")?;
                self.cmd_set(Some(session), rest).await?
            }
            "SGET" => {
                let (session, rest) = split_session(args, "SGET session key")?;
                self.cmd_get(Some(session), rest).await?
            }
            "SDEL" => {
                let (session, rest) = split_session(args, "SDEL session key")?;
                self.cmd_del(Some(session), rest).await?
            }
            "CLEAR" => self.cmd_clear(args).await?,
            "CLEANUP" => self.cmd_cleanup().await?,
            "RESET" => self.cmd_reset().await?,
            "SESSIONS" => self.cmd_sessions().await?,
            "SESSION" => self.cmd_session(args).await?,
            "HEALTH" => self.cmd_health().await?,
            "INFO" | "METRICS" => self.cmd_info().await?,
            "SUMMARY" => self.cmd_summary().await?,
            "PING" => self.cmd_ping().await?,
            "HELP" => self.help_text(),
            _ => return Err(anyhow::anyhow!("Unknown command: {}", command)),
        };

        let elapsed = start.elapsed();
        Ok(format!(
            "{}\n{}",
            response,
            format!("({:.2?})", elapsed).dimmed()
        ))
    }

    async fn cmd_set(&self, session: Option<&str>, args: &[String]) -> Result<String> {
        if args.len() < 2 {
            return Err(anyhow::anyhow!("Usage: SET key value [ttl]"));
        }

        let ttl = args.get(2).and_then(|s| s.parse::<u64>().ok());
        let mut request = self
            .client
            .put(self.url(&format!("/cache/{}", args[0])))
            .json(&json!({ "value": parse_value(&args[1]), "ttl": ttl }));
        if let Some(session) = session {
            request = request.query(&[("session", session)]);
        }

        let (_, res) = self.send(request).await?;
        if res["success"].as_bool().unwrap_or(false) {
            Ok("OK".green().to_string())
        } else {
            Err(anyhow::anyhow!("Error: unexpected response {}", res))
        }
    }

    async fn cmd_get(&self, session: Option<&str>, args: &[String]) -> Result<String> {
        if args.is_empty() {
            return Err(anyhow::anyhow!("Usage: GET key"));
        }

        let mut request = self.client.get(self.url(&format!("/cache/{}", args[0])));
        if let Some(session) = session {
            request = request.query(&[("session", session)]);
        }

        let (status, res) = self.send(request).await?;
        if status == StatusCode::NOT_FOUND {
            Ok("(nil)".dimmed().to_string())
        } else {
            Ok(render(&res["value"]))
        }
    }

    async fn cmd_del(&self, session: Option<&str>, args: &[String]) -> Result<String> {
        if args.is_empty() {
            return Err(anyhow::anyhow!("Usage: DEL key [key ...]"));
        }

        let mut deleted = 0;
        for key in args {
            let mut request = self.client.delete(self.url(&format!("/cache/{}", key)));
            if let Some(session) = session {
                request = request.query(&[("session", session)]);
            }
            let (_, res) = self.send(request).await?;
            if res["deleted"].as_bool().unwrap_or(false) {
                deleted += 1;
            }
        }
        Ok(format!("(integer) {}", deleted))
    }

    async fn cmd_clear(&self, args: &[String]) -> Result<String> {
        let mut request = self.client.post(self.url("/clear"));
        if let Some(pattern) = args.first() {
            request = request.query(&[("pattern", pattern)]);
        }
        let (_, res) = self.send(request).await?;
        Ok(format!(
            "(integer) {}",
            res["removed"].as_u64().unwrap_or(0)
        ))
    }

    async fn cmd_cleanup(&self) -> Result<String> {
        let (_, res) = self.send(self.client.post(self.url("/cleanup"))).await?;
        Ok(serde_json::to_string_pretty(&res)?)
    }

    async fn cmd_reset(&self) -> Result<String> {
        self.send(self.client.post(self.url("/metrics/reset"))).await?;
        Ok("OK".green().to_string())
    }

    async fn cmd_sessions(&self) -> Result<String> {
        let (_, res) = self.send(self.client.get(self.url("/sessions"))).await?;
        let sessions = res.as_array().cloned().unwrap_or_default();
        if sessions.is_empty() {
            return Ok("(empty list)".dimmed().to_string());
        }

        Ok(sessions
            .iter()
            .enumerate()
            .map(|(i, s)| {
                format!(
                    "{}) {} items={} user={}",
                    i + 1,
                    s["session_id"].as_str().unwrap_or("?"),
                    s["item_count"],
                    s["user_id"].as_str().unwrap_or("-"),
                )
            })
            .collect::<Vec<_>>()
            .join("\n"))
    }

    async fn cmd_session(&self, args: &[String]) -> Result<String> {
        let Some(id) = args.first() else {
            return Err(anyhow::anyhow!("Usage: SESSION id"));
        };
        let (status, res) = self
            .send(self.client.get(self.url(&format!("/sessions/{}", id))))
            .await?;
        if status == StatusCode::NOT_FOUND {
            return Ok("(nil)".dimmed().to_string());
        }
        Ok(serde_json::to_string_pretty(&res)?)
    }

    async fn cmd_health(&self) -> Result<String> {
        let res = self
            .client
            .get(self.url("/health"))
            .send()
            .await
            .context("server unreachable")?
            .json::<Value>()
            .await?;

        let report = &res["report"];
        let status = report["status"].as_str().unwrap_or("unknown");
        let mut lines = vec![match status {
            "healthy" => status.green().to_string(),
            "degraded" => status.yellow().to_string(),
            _ => status.red().to_string(),
        }];
        if let Some(issues) = report["issues"].as_array() {
            lines.extend(issues.iter().map(|i| format!("  - {}", i.as_str().unwrap_or(""))));
        }
        Ok(lines.join("\n"))
    }

    async fn cmd_info(&self) -> Result<String> {
        let (_, res) = self.send(self.client.get(self.url("/metrics"))).await?;
        let global = &res["global"];

        let mut out = format!(
            "{}\ngets:{}\nsets:{}\ndeletes:{}\nhit_rate:{:.3}\nerrors:{}\nmemory_bytes:{}\npreferred_provider:{}",
            "# Cache".bold(),
            global["gets"],
            global["sets"],
            global["deletes"],
            global["hit_rate"].as_f64().unwrap_or(0.0),
            global["errors"],
            res["memory_bytes"],
            res["preferred_provider"].as_str().unwrap_or("none"),
        );
        if let Some(tiers) = res["tiers"].as_array() {
            out.push_str(&format!("\n\n{}", "# Tiers".bold()));
            for t in tiers.iter().filter(|t| t["configured"].as_bool() == Some(true)) {
                out.push_str(&format!(
                    "\n{}: hits={} misses={} errors={} healthy={}",
                    t["tier"].as_str().unwrap_or("?"),
                    t["hits"],
                    t["misses"],
                    t["errors"],
                    t["healthy"],
                ));
            }
        }
        Ok(out)
    }

    async fn cmd_summary(&self) -> Result<String> {
        let res = self
            .client
            .get(self.url("/summary"))
            .send()
            .await
            .context("server unreachable")?;
        Ok(res.text().await?)
    }

    async fn cmd_ping(&self) -> Result<String> {
        let res = self.client.get(self.url("/health")).send().await;
        match res {
            Ok(r) if r.status().is_success() => Ok("PONG".green().to_string()),
            Ok(r) => Ok(format!("PONG ({})", r.status()).yellow().to_string()),
            Err(e) => Err(anyhow::anyhow!("Server unreachable: {}", e)),
        }
    }

    fn help_text(&self) -> String {
        format!(
            r#"{}

{}
  SET key value [ttl]          Store a value (JSON or string) with optional TTL
  GET key [session]            Read a value through the tiers
  DEL key [key ...]            Delete keys from every tier

{}
  SSET session key value [ttl] Store a value scoped to a session
  SGET session key             Read a session-scoped value
  SDEL session key             Delete a session-scoped value
  SESSIONS                     List active sessions
  SESSION id                   Show a session and its data

{}
  CLEAR [pattern]              Invalidate keys matching a glob, or everything
  CLEANUP                      Sweep expired entries
  RESET                        Zero metrics and the error log

{}
  HEALTH                       Health verdict with issues
  INFO                         Cache and tier metrics
  METRICS                      Alias for INFO
  SUMMARY                      Human-readable report
  PING                         Ping the server
  HELP                         Show this help message
  QUIT                         Exit the CLI
"#,
            "Strata CLI - Available Commands".bold().cyan(),
            "Basic Commands:".bold(),
            "Session Commands:".bold(),
            "Maintenance:".bold(),
            "Server Commands:".bold(),
        )
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let log_level = std::env::var("RUST_LOG").unwrap_or_else(|_| "info".to_string());
    tracing_subscriber::fmt()
        .with_writer(std::io::stdout)
        .with_env_filter(tracing_subscriber::EnvFilter::new(log_level))
        .with_target(false)
        .with_thread_ids(false)
        .with_thread_names(false)
        .with_file(false)
        .with_line_number(false)
        .without_time()
        .with_level(false)
        .init();

    let args = Args::parse();
    let client = StrataClient::new(&args.host, args.port);

    if let Some((cmd, cmd_args)) = args.command.split_first() {
        match client.execute_command(cmd, cmd_args).await {
            Ok(output) => {
                info!("{}", output);
                Ok(())
            }
            Err(e) => {
                error!(error = %e, "{}", format!("Error: {}", e).red());
                std::process::exit(1);
            }
        }
    } else {
        run_interactive(client, &args.host, args.port).await
    }
}

async fn run_interactive(client: StrataClient, host: &str, port: u16) -> Result<()> {
    info!(
        "{}",
        format!("Strata CLI v{}", env!("CARGO_PKG_VERSION"))
            .bold()
            .cyan()
    );
    info!("Connected to {}:{}", host, port);
    info!("Type {} for available commands\n", "HELP".bold());

    let mut rl = DefaultEditor::new()?;

    loop {
        let prompt = format!("{}> ", format!("strata {}:{}", host, port).green());
        match rl.readline(&prompt) {
            Ok(line) => {
                let parts: Vec<String> = line.split_whitespace().map(String::from).collect();
                let Some((cmd, args)) = parts.split_first() else {
                    continue;
                };
                rl.add_history_entry(&line)?;

                if cmd.eq_ignore_ascii_case("QUIT") || cmd.eq_ignore_ascii_case("EXIT") {
                    info!("Goodbye!");
                    break;
                }

                match client.execute_command(cmd, args).await {
                    Ok(output) => info!("{}", output),
                    Err(e) => {
                        error!(error = %e, "{}", format!("Error: {}", e).red());
                    }
                }
            }
            Err(ReadlineError::Interrupted) => {
                info!("^C");
                continue;
            }
            Err(ReadlineError::Eof) => {
                info!("Goodbye!");
                break;
            }
            Err(err) => {
                error!(error = ?err, "Readline error: {:?}", err);
                break;
            }
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_value() {
        assert_eq!(parse_value("42"), json!(42));
        assert_eq!(parse_value("{\"a\":1}"), json!({"a": 1}));
        assert_eq!(parse_value("hello"), json!("hello"));
    }

    #[test]
    fn test_split_session() {
        let args = vec!["s1".to_string(), "cart".to_string()];
        let (session, rest) = split_session(&args, "SGET session key").unwrap();
        assert_eq!(session, "s1");
        assert_eq!(rest.to_vec(), vec!["cart".to_string()]);
        assert!(split_session(&[], "SGET session key").is_err());
    }

    #[test]
    fn test_render() {
        assert_eq!(render(&json!("x")), "\"x\"");
        assert_eq!(render(&json!([1, 2])), "[1,2]");
    }
}
