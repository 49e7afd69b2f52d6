//! One delivery attempt: the dialog state machine.
//!
//! `Idle -> LookupMx -> Connecting -> AwaitingBanner -> Helo -> [StartTls ->
//! TlsHandshake -> Helo2 ->] [Auth ->] MailFrom -> RcptLoop -> Data -> Quit`.
//! MX resolution happens in the delivery crate; this module takes the
//! resolved targets and produces per-recipient outcomes plus an optional
//! message-level failure.

use std::{
    net::{IpAddr, SocketAddr},
    time::{Duration, Instant},
};

use originator_common::{SendFailure, SendStage, StopToken, TlsAssurance};
use tokio::time::timeout;
use tracing::{debug, trace};

use crate::{
    auth::{self, AuthMechanism},
    client::{DialogIoError, SmtpConnection},
    error::SendError,
    extensions::EhloKeywords,
    reply::Reply,
    tls,
};

/// Per-host connect budget.
pub const CONNECT_SOFT_LIMIT: Duration = Duration::from_secs(30);
/// Banner read budget.
pub const BANNER_SOFT_LIMIT: Duration = Duration::from_secs(5 * 60);
/// Ordinary command-reply budget.
pub const REPLY_SOFT_LIMIT: Duration = Duration::from_secs(5 * 60);
/// Budget for the reply that follows the DATA terminator.
pub const DATA_FINAL_SOFT_LIMIT: Duration = Duration::from_secs(10 * 60);
/// Best-effort QUIT budget.
const QUIT_SOFT_LIMIT: Duration = Duration::from_secs(10);

/// A resolved MX candidate: hostname for SNI/diagnostics, addresses to dial.
#[derive(Debug, Clone)]
pub struct MxTarget {
    pub host: String,
    pub port: u16,
    pub addrs: Vec<IpAddr>,
}

impl MxTarget {
    fn socket_addrs(&self) -> impl Iterator<Item = SocketAddr> + '_ {
        let port = self.port;
        self.addrs.iter().map(move |ip| SocketAddr::new(*ip, port))
    }
}

/// Relay credentials.
#[derive(Debug, Clone)]
pub struct RelayAuth {
    pub mechanism: AuthMechanism,
    pub username: String,
    pub password: String,
}

/// Everything one attempt needs besides the resolved targets.
#[derive(Debug, Clone)]
pub struct AttemptSpec<'a> {
    /// Name presented in EHLO.
    pub ehlo_name: String,
    pub from_address: String,
    /// Recipients still pending for this message.
    pub mailboxes: Vec<String>,
    /// Encoded MIME payload, fed into DATA verbatim (modulo dot-stuffing).
    pub content: &'a [u8],
    /// Identities that satisfy `TlsDomainMatchCert`: the recipient domain
    /// plus any additional match domains.
    pub match_domains: Vec<String>,
    pub tls_requirement: TlsAssurance,
    /// Wrap the TCP stream in TLS before the banner (relay implicit TLS).
    pub implicit_tls: bool,
    pub auth: Option<RelayAuth>,
    /// Total dialog budget in seconds.
    pub budget_secs: u64,
}

/// Decision reached for one recipient during the dialog.
#[derive(Debug, Clone)]
pub enum MailboxDisposition {
    Succeeded { mx: String },
    TempFailed(SendFailure),
    PermFailed(SendFailure),
}

#[derive(Debug, Clone)]
pub struct MailboxOutcome {
    pub mailbox: String,
    pub disposition: MailboxDisposition,
}

/// What one attempt produced.
#[derive(Debug)]
pub struct AttemptReport {
    /// Host the dialog ran against; empty when no connect succeeded.
    pub mx: String,
    pub tls_achieved: TlsAssurance,
    /// Per-recipient decisions, in dialog order.
    pub outcomes: Vec<MailboxOutcome>,
    /// Message-level failure; recipients without an outcome entry are
    /// governed by its permanence.
    pub failure: Option<SendError>,
}

struct Budget {
    deadline: Instant,
}

impl Budget {
    fn new(secs: u64) -> Self {
        Self {
            deadline: Instant::now() + Duration::from_secs(secs),
        }
    }

    /// Time available for the next operation: the phase's soft limit capped
    /// by what remains of the total dialog budget.
    fn phase(&self, stage: SendStage, mx: &str, soft: Duration) -> Result<Duration, SendError> {
        let remaining = self.deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return Err(SendError::timeout(stage, mx));
        }
        Ok(soft.min(remaining))
    }
}

struct AttemptState {
    mx: String,
    tls: TlsAssurance,
    outcomes: Vec<MailboxOutcome>,
}

enum DialError {
    /// Message-level failure; outcomes gathered so far stand.
    Fail(SendError),
    /// Opportunistic STARTTLS broke; redial in cleartext.
    RetryWithoutTls,
}

impl From<SendError> for DialError {
    fn from(e: SendError) -> Self {
        Self::Fail(e)
    }
}

fn io_error(stage: SendStage, mx: &str, e: DialogIoError) -> SendError {
    match e {
        DialogIoError::TimedOut => SendError::timeout(stage, mx),
        DialogIoError::Parse(p) => SendError::protocol(stage, mx, p.to_string()),
        DialogIoError::ReplyTooLarge => SendError::protocol(stage, mx, "reply too large"),
        DialogIoError::ConnectionClosed => SendError::network(stage, mx, "connection closed"),
        DialogIoError::Io(e) => SendError::network(stage, mx, e.to_string()),
    }
}

fn check_stop(stop: Option<&StopToken>, stage: SendStage, mx: &str) -> Result<(), SendError> {
    if stop.is_some_and(StopToken::is_stopping) {
        return Err(SendError::cancelled(stage, mx));
    }
    Ok(())
}

/// Run one attempt to completion. Never panics, never returns early with
/// partial state: whatever was decided per recipient is in the report.
pub async fn run_attempt(
    spec: &AttemptSpec<'_>,
    targets: &[MxTarget],
    stop: Option<&StopToken>,
) -> AttemptReport {
    let budget = Budget::new(spec.budget_secs);
    let mut state = AttemptState {
        mx: String::new(),
        tls: TlsAssurance::NoTls,
        outcomes: Vec::new(),
    };

    let mut allow_opportunistic = true;
    loop {
        match dial(spec, targets, stop, &budget, allow_opportunistic, &mut state).await {
            Ok(()) => {
                return AttemptReport {
                    mx: state.mx,
                    tls_achieved: state.tls,
                    outcomes: state.outcomes,
                    failure: None,
                }
            }
            Err(DialError::RetryWithoutTls) => {
                debug!(mx = %state.mx, "opportunistic TLS failed, redialing in cleartext");
                allow_opportunistic = false;
                state.mx.clear();
                state.tls = TlsAssurance::NoTls;
                state.outcomes.clear();
            }
            Err(DialError::Fail(failure)) => {
                return AttemptReport {
                    mx: state.mx,
                    tls_achieved: state.tls,
                    outcomes: state.outcomes,
                    failure: Some(failure),
                }
            }
        }
    }
}

#[allow(clippy::too_many_lines)]
async fn dial(
    spec: &AttemptSpec<'_>,
    targets: &[MxTarget],
    stop: Option<&StopToken>,
    budget: &Budget,
    allow_opportunistic: bool,
    state: &mut AttemptState,
) -> Result<(), DialError> {
    // Connecting: first successful connect wins.
    check_stop(stop, SendStage::Connect, "")?;
    let mut conn = None;
    let mut last_connect_error = None;
    'connect: for target in targets {
        for addr in target.socket_addrs() {
            check_stop(stop, SendStage::Connect, &target.host)?;
            let limit = budget.phase(SendStage::Connect, &target.host, CONNECT_SOFT_LIMIT)?;
            match SmtpConnection::connect(addr, limit).await {
                Ok(c) => {
                    trace!(host = %target.host, %addr, "connected");
                    state.mx = target.host.clone();
                    conn = Some(c);
                    break 'connect;
                }
                Err(e) => {
                    debug!(host = %target.host, %addr, error = %e, "connect failed");
                    last_connect_error = Some(e);
                }
            }
        }
    }
    let Some(mut conn) = conn else {
        let detail = last_connect_error
            .map_or_else(|| "no targets".to_string(), |e| e.to_string());
        return Err(SendError::network(
            SendStage::Connect,
            "",
            format!("all hosts unreachable: {detail}"),
        )
        .into());
    };
    let mx = state.mx.clone();

    // Implicit TLS wraps the stream before any reply is read.
    if spec.implicit_tls {
        let assured = tls::assured_connector(&mx, &spec.match_domains)
            .map_err(|e| SendError::tls(SendStage::TlsHandshake, &mx, e, false))?;
        let limit = budget.phase(SendStage::TlsHandshake, &mx, REPLY_SOFT_LIMIT)?;
        conn = match timeout(limit, conn.into_tls(&assured.connector, assured.server_name)).await {
            Ok(Ok(c)) => c,
            Ok(Err(e)) => {
                return Err(SendError::tls(SendStage::TlsHandshake, &mx, e.to_string(), false).into())
            }
            Err(_) => return Err(SendError::timeout(SendStage::TlsHandshake, &mx).into()),
        };
        state.tls = assured.handle.achieved();
    }

    // Banner.
    let limit = budget.phase(SendStage::Greeting, &mx, BANNER_SOFT_LIMIT)?;
    let banner = conn
        .read_reply(limit)
        .await
        .map_err(|e| io_error(SendStage::Greeting, &mx, e))?;
    if !banner.is_positive_completion() {
        return Err(SendError::from_reply(SendStage::Greeting, &mx, banner).into());
    }

    // EHLO.
    let mut keywords = ehlo(&mut conn, spec, budget, &mx).await?;

    // STARTTLS, when required or opportunistically available.
    if !conn.is_tls() {
        let required = spec.tls_requirement >= TlsAssurance::StartTls;
        if required && !keywords.starttls {
            return Err(SendError::tls(
                SendStage::StartTls,
                &mx,
                "STARTTLS required but not offered",
                true,
            )
            .into());
        }
        if keywords.starttls && (required || allow_opportunistic) {
            let limit = budget.phase(SendStage::StartTls, &mx, REPLY_SOFT_LIMIT)?;
            let reply = conn
                .command("STARTTLS", limit)
                .await
                .map_err(|e| io_error(SendStage::StartTls, &mx, e))?;
            if reply.is_positive_completion() {
                let assured = match tls::assured_connector(&mx, &spec.match_domains) {
                    Ok(a) => a,
                    Err(e) if required => {
                        return Err(SendError::tls(SendStage::TlsHandshake, &mx, e, false).into())
                    }
                    Err(_) => return Err(DialError::RetryWithoutTls),
                };
                let limit = budget.phase(SendStage::TlsHandshake, &mx, REPLY_SOFT_LIMIT)?;
                conn = match timeout(limit, conn.into_tls(&assured.connector, assured.server_name))
                    .await
                {
                    Ok(Ok(c)) => c,
                    Ok(Err(e)) if required => {
                        return Err(
                            SendError::tls(SendStage::TlsHandshake, &mx, e.to_string(), false)
                                .into(),
                        )
                    }
                    Err(_) if required => {
                        return Err(SendError::timeout(SendStage::TlsHandshake, &mx).into())
                    }
                    // Opportunistic failure is swallowed; redial cleartext.
                    Ok(Err(_)) | Err(_) => return Err(DialError::RetryWithoutTls),
                };
                state.tls = assured.handle.achieved();

                // Helo2: the keyword record is replaced wholesale.
                keywords = ehlo(&mut conn, spec, budget, &mx).await?;
            } else if required {
                return Err(SendError::from_reply(SendStage::StartTls, &mx, reply).into());
            }
            // Opportunistic STARTTLS refused by the peer: stay cleartext.
        }
    }

    // Assurance policy: applied after the handshake, not during it.
    if state.tls < spec.tls_requirement {
        return Err(SendError::tls(
            SendStage::TlsHandshake,
            &mx,
            format!(
                "TLS assurance insufficient: achieved {:?}, required {:?}",
                state.tls, spec.tls_requirement
            ),
            false,
        )
        .into());
    }

    // AUTH, relay-only.
    if let Some(relay_auth) = &spec.auth {
        authenticate(&mut conn, relay_auth, &keywords, budget, &mx).await?;
    }

    // MAIL FROM.
    let limit = budget.phase(SendStage::MailFrom, &mx, REPLY_SOFT_LIMIT)?;
    let mail_cmd = if keywords.size.is_some() {
        format!(
            "MAIL FROM:<{}> SIZE={}",
            spec.from_address,
            spec.content.len()
        )
    } else {
        format!("MAIL FROM:<{}>", spec.from_address)
    };
    let reply = conn
        .command(&mail_cmd, limit)
        .await
        .map_err(|e| io_error(SendStage::MailFrom, &mx, e))?;
    if !reply.is_positive_completion() {
        return Err(SendError::from_reply(SendStage::MailFrom, &mx, reply).into());
    }

    // RcptLoop: per-recipient accounting.
    let mut accepted = Vec::new();
    for mailbox in &spec.mailboxes {
        check_stop(stop, SendStage::RcptTo, &mx)?;
        let limit = budget.phase(SendStage::RcptTo, &mx, REPLY_SOFT_LIMIT)?;
        let reply = conn
            .command(&format!("RCPT TO:<{mailbox}>"), limit)
            .await
            .map_err(|e| io_error(SendStage::RcptTo, &mx, e))?;
        if reply.is_positive_completion() {
            accepted.push(mailbox.clone());
        } else {
            let err = SendError::from_reply(SendStage::RcptTo, &mx, reply);
            let disposition = if err.permanent {
                MailboxDisposition::PermFailed(err.to_failure())
            } else {
                MailboxDisposition::TempFailed(err.to_failure())
            };
            state.outcomes.push(MailboxOutcome {
                mailbox: mailbox.clone(),
                disposition,
            });
        }
    }

    // No acceptances: skip DATA entirely.
    if accepted.is_empty() {
        quit(&mut conn, budget, &mx).await;
        return Ok(());
    }

    // Data.
    check_stop(stop, SendStage::Data, &mx)?;
    let limit = budget.phase(SendStage::Data, &mx, REPLY_SOFT_LIMIT)?;
    let reply = conn
        .command("DATA", limit)
        .await
        .map_err(|e| io_error(SendStage::Data, &mx, e))?;
    if reply.is_positive_intermediate() {
        let limit = budget.phase(SendStage::Data, &mx, DATA_FINAL_SOFT_LIMIT)?;
        conn.send_data(spec.content, limit)
            .await
            .map_err(|e| io_error(SendStage::Data, &mx, e))?;

        let limit = budget.phase(SendStage::Data, &mx, DATA_FINAL_SOFT_LIMIT)?;
        let final_reply = conn
            .read_reply(limit)
            .await
            .map_err(|e| io_error(SendStage::Data, &mx, e))?;

        if final_reply.is_positive_completion() {
            for mailbox in accepted {
                state.outcomes.push(MailboxOutcome {
                    mailbox,
                    disposition: MailboxDisposition::Succeeded { mx: mx.clone() },
                });
            }
        } else {
            settle_accepted(state, accepted, SendError::from_reply(SendStage::Data, &mx, final_reply));
        }
    } else {
        // DATA itself refused: only the accepted recipients are affected.
        settle_accepted(state, accepted, SendError::from_reply(SendStage::Data, &mx, reply));
    }

    quit(&mut conn, budget, &mx).await;
    Ok(())
}

async fn ehlo(
    conn: &mut SmtpConnection,
    spec: &AttemptSpec<'_>,
    budget: &Budget,
    mx: &str,
) -> Result<EhloKeywords, SendError> {
    let limit = budget.phase(SendStage::Helo, mx, REPLY_SOFT_LIMIT)?;
    let reply = conn
        .command(&format!("EHLO {}", spec.ehlo_name), limit)
        .await
        .map_err(|e| io_error(SendStage::Helo, mx, e))?;
    if !reply.is_positive_completion() {
        return Err(SendError::from_reply(SendStage::Helo, mx, reply));
    }
    Ok(EhloKeywords::parse(&reply))
}

fn auth_reply_error(mx: &str, reply: Reply) -> SendError {
    SendError::auth(
        mx,
        format!("server replied {reply}"),
        reply.is_permanent_failure(),
    )
}

async fn authenticate(
    conn: &mut SmtpConnection,
    relay_auth: &RelayAuth,
    keywords: &EhloKeywords,
    budget: &Budget,
    mx: &str,
) -> Result<(), SendError> {
    if !keywords.supports_auth(relay_auth.mechanism.token()) {
        return Err(SendError::auth(
            mx,
            format!("no common mechanism: server does not offer {}", relay_auth.mechanism),
            true,
        ));
    }

    let limit = budget.phase(SendStage::Auth, mx, REPLY_SOFT_LIMIT)?;
    let io = |e| io_error(SendStage::Auth, mx, e);

    let final_reply = match relay_auth.mechanism {
        AuthMechanism::Plain => {
            let initial =
                auth::plain_initial_response(&relay_auth.username, &relay_auth.password);
            conn.command(&format!("AUTH PLAIN {initial}"), limit)
                .await
                .map_err(io)?
        }
        AuthMechanism::Login => {
            let reply = conn.command("AUTH LOGIN", limit).await.map_err(io)?;
            if reply.code != 334 {
                return Err(auth_reply_error(mx, reply));
            }
            let reply = conn
                .command(&auth::login_username(&relay_auth.username), limit)
                .await
                .map_err(io)?;
            if reply.code != 334 {
                return Err(auth_reply_error(mx, reply));
            }
            conn.command(&auth::login_password(&relay_auth.password), limit)
                .await
                .map_err(io)?
        }
        AuthMechanism::CramMd5 => {
            let reply = conn.command("AUTH CRAM-MD5", limit).await.map_err(io)?;
            if reply.code != 334 {
                return Err(auth_reply_error(mx, reply));
            }
            let response = auth::cram_md5_response(
                &relay_auth.username,
                &relay_auth.password,
                reply.first_text(),
            )
            .map_err(|desc| SendError::auth(mx, desc, false))?;
            conn.command(&response, limit).await.map_err(io)?
        }
    };

    if final_reply.is_positive_completion() {
        Ok(())
    } else {
        Err(auth_reply_error(mx, final_reply))
    }
}

/// Apply one DATA-phase verdict to every recipient that had passed RCPT.
fn settle_accepted(state: &mut AttemptState, accepted: Vec<String>, err: SendError) {
    for mailbox in accepted {
        let disposition = if err.permanent {
            MailboxDisposition::PermFailed(err.to_failure())
        } else {
            MailboxDisposition::TempFailed(err.to_failure())
        };
        state.outcomes.push(MailboxOutcome {
            mailbox,
            disposition,
        });
    }
}

/// Best-effort QUIT; errors here never affect the outcome.
async fn quit(conn: &mut SmtpConnection, budget: &Budget, mx: &str) {
    if let Ok(limit) = budget.phase(SendStage::Quit, mx, QUIT_SOFT_LIMIT) {
        let _ = conn.command("QUIT", limit).await;
    }
}
