//! Configurable mock SMTP server for delivery tests.
//!
//! Speaks just enough of the server side to script delivery scenarios:
//! per-command response overrides, per-recipient RCPT responses, optional
//! STARTTLS acceptance (without actually speaking TLS, which lets tests
//! exercise handshake failures), command capture and a session counter.

use std::{
    net::SocketAddr,
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};

use tokio::{
    io::{AsyncBufReadExt, AsyncWriteExt, BufReader},
    net::{TcpListener, TcpStream},
    time::timeout,
};

#[derive(Debug, Clone)]
pub struct SmtpResponse {
    pub code: u16,
    pub message: String,
}

impl SmtpResponse {
    fn new(code: u16, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    fn to_bytes(&self) -> Vec<u8> {
        format!("{} {}\r\n", self.code, self.message).into_bytes()
    }
}

#[derive(Clone)]
struct MockServerConfig {
    greeting: SmtpResponse,
    ehlo_code: u16,
    ehlo_capabilities: Vec<String>,
    mail_from_response: SmtpResponse,
    rcpt_to_response: SmtpResponse,
    rcpt_overrides: Vec<(String, SmtpResponse)>,
    data_response: SmtpResponse,
    data_end_response: SmtpResponse,
    quit_response: SmtpResponse,
    starttls_response: Option<SmtpResponse>,
    auth_response: Option<SmtpResponse>,
}

impl Default for MockServerConfig {
    fn default() -> Self {
        Self {
            greeting: SmtpResponse::new(220, "mock.example.test ESMTP"),
            ehlo_code: 250,
            ehlo_capabilities: vec!["mock.example.test".to_string(), "SIZE 35882577".to_string()],
            mail_from_response: SmtpResponse::new(250, "OK"),
            rcpt_to_response: SmtpResponse::new(250, "OK"),
            rcpt_overrides: Vec::new(),
            data_response: SmtpResponse::new(354, "End data with <CR><LF>.<CR><LF>"),
            data_end_response: SmtpResponse::new(250, "2.0.0 accepted"),
            quit_response: SmtpResponse::new(221, "bye"),
            starttls_response: None,
            auth_response: None,
        }
    }
}

impl MockServerConfig {
    fn ehlo_bytes(&self) -> Vec<u8> {
        let mut out = String::new();
        let last = self.ehlo_capabilities.len().saturating_sub(1);
        for (i, cap) in self.ehlo_capabilities.iter().enumerate() {
            let sep = if i == last { ' ' } else { '-' };
            out.push_str(&format!("{}{sep}{cap}\r\n", self.ehlo_code));
        }
        out.into_bytes()
    }
}

/// Running mock server; drop-safe, stop with [`MockSmtpServer::shutdown`].
pub struct MockSmtpServer {
    addr: SocketAddr,
    commands: Arc<Mutex<Vec<String>>>,
    sessions: Arc<AtomicUsize>,
    shutdown: Arc<AtomicBool>,
}

#[allow(dead_code)] // test utility surface; not every test uses every method
impl MockSmtpServer {
    pub fn builder() -> MockSmtpServerBuilder {
        MockSmtpServerBuilder {
            config: MockServerConfig::default(),
        }
    }

    pub const fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// All command lines received, across sessions.
    pub fn commands(&self) -> Vec<String> {
        self.commands.lock().expect("commands mutex poisoned").clone()
    }

    /// Number of accepted connections.
    pub fn sessions(&self) -> usize {
        self.sessions.load(Ordering::Relaxed)
    }

    pub fn shutdown(&self) {
        self.shutdown.store(true, Ordering::Relaxed);
    }

    async fn handle_client(
        mut stream: TcpStream,
        config: Arc<MockServerConfig>,
        commands: Arc<Mutex<Vec<String>>>,
    ) -> std::io::Result<()> {
        let (read_half, mut writer) = stream.split();
        let mut reader = BufReader::new(read_half);
        let mut line = String::new();

        writer.write_all(&config.greeting.to_bytes()).await?;
        writer.flush().await?;

        loop {
            line.clear();
            // Short enough that a client stuck mid-TLS-handshake sees EOF
            // quickly instead of waiting out its own reply budget.
            let read = timeout(Duration::from_secs(3), reader.read_line(&mut line)).await;
            let Ok(Ok(n)) = read else { return Ok(()) };
            if n == 0 {
                return Ok(());
            }

            let cmd = line.trim_end().to_string();
            commands.lock().expect("commands mutex poisoned").push(cmd.clone());
            let verb = cmd
                .split([' ', ':'])
                .next()
                .unwrap_or("")
                .to_ascii_uppercase();

            let response = match verb.as_str() {
                "EHLO" | "HELO" => config.ehlo_bytes(),
                "MAIL" => config.mail_from_response.to_bytes(),
                "RCPT" => config
                    .rcpt_overrides
                    .iter()
                    .find(|(needle, _)| cmd.contains(needle.as_str()))
                    .map_or_else(|| config.rcpt_to_response.to_bytes(), |(_, r)| r.to_bytes()),
                "DATA" => config.data_response.to_bytes(),
                "QUIT" => {
                    writer.write_all(&config.quit_response.to_bytes()).await?;
                    writer.flush().await?;
                    return Ok(());
                }
                "STARTTLS" => config.starttls_response.as_ref().map_or_else(
                    || SmtpResponse::new(502, "not implemented").to_bytes(),
                    SmtpResponse::to_bytes,
                ),
                "AUTH" => config.auth_response.as_ref().map_or_else(
                    || SmtpResponse::new(502, "not implemented").to_bytes(),
                    SmtpResponse::to_bytes,
                ),
                _ => SmtpResponse::new(500, "unknown command").to_bytes(),
            };
            writer.write_all(&response).await?;
            writer.flush().await?;

            if verb == "DATA" && config.data_response.code == 354 {
                let mut data_line = String::new();
                loop {
                    data_line.clear();
                    if reader.read_line(&mut data_line).await? == 0 {
                        return Ok(());
                    }
                    if data_line.trim_end() == "." {
                        writer.write_all(&config.data_end_response.to_bytes()).await?;
                        writer.flush().await?;
                        break;
                    }
                }
            }
        }
    }
}

pub struct MockSmtpServerBuilder {
    config: MockServerConfig,
}

#[allow(dead_code)] // test utility surface; not every test uses every knob
impl MockSmtpServerBuilder {
    #[must_use]
    pub fn with_greeting(mut self, code: u16, message: impl Into<String>) -> Self {
        self.config.greeting = SmtpResponse::new(code, message);
        self
    }

    #[must_use]
    pub fn with_ehlo_capabilities(mut self, capabilities: Vec<String>) -> Self {
        self.config.ehlo_capabilities = capabilities;
        self
    }

    #[must_use]
    pub fn with_mail_from_response(mut self, code: u16, message: impl Into<String>) -> Self {
        self.config.mail_from_response = SmtpResponse::new(code, message);
        self
    }

    #[must_use]
    pub fn with_rcpt_to_response(mut self, code: u16, message: impl Into<String>) -> Self {
        self.config.rcpt_to_response = SmtpResponse::new(code, message);
        self
    }

    /// Response override for any RCPT line containing `needle`.
    #[must_use]
    pub fn with_rcpt_response_for(
        mut self,
        needle: impl Into<String>,
        code: u16,
        message: impl Into<String>,
    ) -> Self {
        self.config
            .rcpt_overrides
            .push((needle.into(), SmtpResponse::new(code, message)));
        self
    }

    #[must_use]
    pub fn with_data_response(mut self, code: u16, message: impl Into<String>) -> Self {
        self.config.data_response = SmtpResponse::new(code, message);
        self
    }

    #[must_use]
    pub fn with_data_end_response(mut self, code: u16, message: impl Into<String>) -> Self {
        self.config.data_end_response = SmtpResponse::new(code, message);
        self
    }

    /// Accept STARTTLS with this reply. The mock never actually speaks TLS,
    /// so a 2xx here makes the subsequent handshake fail; that is the point.
    #[must_use]
    pub fn with_starttls_response(mut self, code: u16, message: impl Into<String>) -> Self {
        self.config.starttls_response = Some(SmtpResponse::new(code, message));
        self
    }

    #[must_use]
    pub fn with_auth_response(mut self, code: u16, message: impl Into<String>) -> Self {
        self.config.auth_response = Some(SmtpResponse::new(code, message));
        self
    }

    pub async fn build(self) -> std::io::Result<MockSmtpServer> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;

        let config = Arc::new(self.config);
        let commands = Arc::new(Mutex::new(Vec::new()));
        let sessions = Arc::new(AtomicUsize::new(0));
        let shutdown = Arc::new(AtomicBool::new(false));

        let accept_config = Arc::clone(&config);
        let accept_commands = Arc::clone(&commands);
        let accept_sessions = Arc::clone(&sessions);
        let accept_shutdown = Arc::clone(&shutdown);

        tokio::spawn(async move {
            loop {
                if accept_shutdown.load(Ordering::Relaxed) {
                    break;
                }
                let accepted = timeout(Duration::from_millis(100), listener.accept()).await;
                if let Ok(Ok((stream, _peer))) = accepted {
                    accept_sessions.fetch_add(1, Ordering::Relaxed);
                    let config = Arc::clone(&accept_config);
                    let commands = Arc::clone(&accept_commands);
                    tokio::spawn(async move {
                        let _ = MockSmtpServer::handle_client(stream, config, commands).await;
                    });
                }
            }
        });

        Ok(MockSmtpServer {
            addr,
            commands,
            sessions,
            shutdown,
        })
    }
}
