//! Interactive configuration wizard, used when no config file exists.

use std::io::{BufRead, Write};
use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use colored::Colorize;

use uproxy_relay::{BackendScheme, Config, ProxyConfig, ReverseProxyConfig};

/// Reads answers from `input` and writes questions to `output`.
pub struct Wizard<R, W> {
    input: R,
    output: W,
}

impl<R: BufRead, W: Write> Wizard<R, W> {
    pub fn new(input: R, output: W) -> Self {
        Self { input, output }
    }

    /// Ask for routes until the user declines to add another.
    pub fn run(mut self) -> Result<Config> {
        let mut config = Config {
            debug_mode: self.ask_bool("Enable debug mode? (true/false): ")?,
            ..Config::default()
        };

        loop {
            writeln!(self.output, "{}", "Select proxy type:".bold())?;
            writeln!(self.output, "1 = TCP")?;
            writeln!(self.output, "2 = UDP")?;
            writeln!(self.output, "3 = Reverse HTTP(S) Proxy")?;

            match self.ask("Your choice: ")?.as_str() {
                choice @ ("1" | "2") => {
                    let proxy = ProxyConfig {
                        listen_port: self.ask_port("Listening port: ")?,
                        listen_ip: "0.0.0.0".to_string(),
                        server_host: self.ask_non_empty("Remote server IP or hostname: ")?,
                        server_port: self.ask_port("Remote server port: ")?,
                        proto_tcp: choice == "1",
                    };
                    config.proxies.push(proxy);
                }
                "3" => {
                    let listen_port = self.ask_port("Listening port (443 recommended): ")?;
                    let cert_file =
                        self.ask_non_empty("Full path to SSL certificate file (.pem): ")?;
                    let key_file =
                        self.ask_non_empty("Full path to SSL private key file (.key): ")?;
                    let server_host = self.ask_non_empty(
                        "Remote backend (e.g. 10.0.0.5:8080 or backend.example.com:443): ",
                    )?;
                    let scheme = self.ask_scheme()?;

                    config.reverse_proxies.push(ReverseProxyConfig {
                        listen_port,
                        listen_ip: "0.0.0.0".to_string(),
                        cert_file: PathBuf::from(cert_file),
                        key_file: PathBuf::from(key_file),
                        server_host,
                        server_proto: scheme.to_string(),
                        domain: None,
                    });
                }
                _ => writeln!(self.output, "{}", "Invalid choice.".yellow())?,
            }

            let more = self.ask("Add another proxy config? (y/n): ")?;
            if !more.eq_ignore_ascii_case("y") {
                break;
            }
        }

        Ok(config)
    }

    fn ask(&mut self, question: &str) -> Result<String> {
        write!(self.output, "{}", question)?;
        self.output.flush()?;

        let mut line = String::new();
        let read = self
            .input
            .read_line(&mut line)
            .context("failed to read answer")?;
        if read == 0 {
            bail!("input closed before configuration was complete");
        }
        Ok(line.trim().to_string())
    }

    fn ask_non_empty(&mut self, question: &str) -> Result<String> {
        loop {
            let answer = self.ask(question)?;
            if !answer.is_empty() {
                return Ok(answer);
            }
            writeln!(self.output, "{}", "A value is required.".yellow())?;
        }
    }

    fn ask_bool(&mut self, question: &str) -> Result<bool> {
        loop {
            match self.ask(question)?.to_ascii_lowercase().as_str() {
                "true" | "y" | "yes" | "1" => return Ok(true),
                "false" | "n" | "no" | "0" | "" => return Ok(false),
                _ => writeln!(self.output, "{}", "Answer 'true' or 'false'.".yellow())?,
            }
        }
    }

    fn ask_port(&mut self, question: &str) -> Result<u16> {
        loop {
            match self.ask(question)?.parse::<u16>() {
                Ok(port) if port != 0 => return Ok(port),
                _ => writeln!(self.output, "{}", "Enter a port between 1 and 65535.".yellow())?,
            }
        }
    }

    fn ask_scheme(&mut self) -> Result<BackendScheme> {
        loop {
            match self.ask("Backend protocol (http or https): ")?.parse() {
                Ok(scheme) => return Ok(scheme),
                Err(_) => writeln!(
                    self.output,
                    "{}",
                    "Invalid protocol. Choose 'http' or 'https'".yellow()
                )?,
            }
        }
    }
}
