//! Completion notifications.
//!
//! Composes one message per freshly completed group and dispatches it
//! through a mail transport. Dispatch failures never unwind completion,
//! archival, or the ledger. The shipped transport is a plain-SMTP client;
//! the trait seam lets tests and other deployments substitute their own.

use std::io::{BufRead, BufReader, Write};
use std::net::TcpStream;
use std::path::Path;

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use tracing::{debug, info};

use crate::error::{DnaError, Result};
use crate::store::ObsRequest;

/// Collaborator seam for the mail transport.
pub trait MailTransport {
    fn send(&mut self, recipients: &[String], from: &str, subject: &str, body: &str) -> Result<()>;
}

/// Optional recipient/target scoping for notification sends.
///
/// Matching is case-insensitive substring containment; an unset field
/// matches everything, so both, either, or neither may be given.
#[derive(Debug, Clone, Default)]
pub struct NotificationFilter {
    pub user: Option<String>,
    pub object: Option<String>,
}

impl NotificationFilter {
    pub fn new(user: Option<String>, object: Option<String>) -> Self {
        let nonblank = |s: Option<String>| s.filter(|v| !v.trim().is_empty());
        Self {
            user: nonblank(user),
            object: nonblank(object),
        }
    }

    /// Whether a completion for `email`/`object_name` should be sent.
    pub fn matches(&self, email: &str, object_name: &str) -> bool {
        let user_ok = self
            .user
            .as_ref()
            .map_or(true, |user| email.to_lowercase().contains(&user.to_lowercase()));
        let object_ok = self.object.as_ref().map_or(true, |object| {
            object_name.to_lowercase().contains(&object.to_lowercase())
        });
        user_ok && object_ok
    }
}

/// Compose the (subject, body) pair for a completed request.
///
/// `calibrations` are the sibling calibration bundles present on disk for
/// the same night, linked so the user can fetch reduction data.
pub fn compose_completion(
    req: &ObsRequest,
    bundle: &Path,
    calibrations: &[(String, std::path::PathBuf)],
    archive_url_base: &str,
) -> (String, String) {
    let subject = format!("ARTN ORP Completed {}", req.object_name);

    let bundle_name = bundle
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default();
    let mut body = format!(
        "{} observed using the {} telescope with {}\n\
         RA: {}  Dec: {}  Epoch: J2000\n\
         {} x {}s exposures, in the {} filter, at airmass {}\n\
         Data archive: {archive_url_base}/{bundle_name}\n\
         NB: Calibration data may not be available until 08:00 the following day (or at all!)",
        req.object_name,
        req.telescope,
        req.instrument,
        req.ra_hms,
        req.dec_dms,
        req.num_exp,
        req.exp_time,
        req.filter_name,
        req.airmass,
    );
    for (label, path) in calibrations {
        let name = path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_default();
        let mut label = label.clone();
        if let Some(first) = label.get_mut(..1) {
            first.make_ascii_uppercase();
        }
        body.push_str(&format!("\n{label} archive: {archive_url_base}/{name}"));
    }
    (subject, body)
}

/// Dispatch policy bundling a transport with the sending identity and the
/// optional recipient/target filters.
pub struct Notifier<'a> {
    pub transport: &'a mut dyn MailTransport,
    /// Sender address; also copied on every notification so the operator
    /// keeps a record.
    pub from: String,
    pub filter: NotificationFilter,
}

impl<'a> Notifier<'a> {
    pub fn new(transport: &'a mut dyn MailTransport, from: String, filter: NotificationFilter) -> Self {
        Self {
            transport,
            from,
            filter,
        }
    }

    /// Send one completion notification, unless the filters exclude it.
    /// Returns whether a message was actually dispatched.
    pub fn notify(
        &mut self,
        req: &ObsRequest,
        email: &str,
        bundle: &Path,
        calibrations: &[(String, std::path::PathBuf)],
        archive_url_base: &str,
    ) -> Result<bool> {
        if !self.filter.matches(email, &req.object_name) {
            debug!("notification for {} filtered out", req.object_name);
            return Ok(false);
        }
        let (subject, body) = compose_completion(req, bundle, calibrations, archive_url_base);
        let recipients = vec![email.to_string(), self.from.clone()];
        self.transport.send(&recipients, &self.from, &subject, &body)?;
        Ok(true)
    }
}

/// SMTP endpoint configuration, read from the conventional `MAIL_*`
/// environment.
#[derive(Debug, Clone)]
pub struct SmtpConfig {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: Option<String>,
}

impl SmtpConfig {
    /// Build from `MAIL_SERVER`, `MAIL_PORT`, `MAIL_USERNAME` and
    /// `MAIL_PASSWORD`. Returns `None` when the server or sender is not
    /// configured.
    pub fn from_env() -> Option<Self> {
        let host = std::env::var("MAIL_SERVER").ok()?;
        let username = std::env::var("MAIL_USERNAME").ok()?;
        let port = std::env::var("MAIL_PORT")
            .ok()
            .and_then(|raw| raw.parse().ok())
            .unwrap_or(587);
        Some(Self {
            host,
            port,
            username,
            password: std::env::var("MAIL_PASSWORD").ok(),
        })
    }
}

/// Plain-SMTP mail transport over a TCP stream.
pub struct SmtpTransport {
    reader: BufReader<TcpStream>,
    writer: TcpStream,
}

impl SmtpTransport {
    /// Connect, greet, and (when a password is configured) authenticate
    /// with `AUTH LOGIN`.
    pub fn connect(config: &SmtpConfig) -> Result<Self> {
        let stream = TcpStream::connect((config.host.as_str(), config.port))
            .map_err(|err| DnaError::Mail(format!("cannot connect {}: {err}", config.host)))?;
        let writer = stream
            .try_clone()
            .map_err(|err| DnaError::Mail(format!("cannot clone stream: {err}")))?;
        let mut transport = Self {
            reader: BufReader::new(stream),
            writer,
        };
        transport.expect_reply(220)?;
        transport.command("EHLO dna", 250)?;
        if let Some(password) = &config.password {
            transport.command("AUTH LOGIN", 334)?;
            transport.command(&BASE64.encode(&config.username), 334)?;
            transport.command(&BASE64.encode(password), 235)?;
        }
        debug!("SMTP session established with {}", config.host);
        Ok(transport)
    }

    /// Send `QUIT` and drop the session. Best effort.
    pub fn quit(&mut self) {
        let _ = self.write_line("QUIT");
        let _ = self.read_reply();
    }

    fn write_line(&mut self, line: &str) -> Result<()> {
        self.writer
            .write_all(line.as_bytes())
            .and_then(|()| self.writer.write_all(b"\r\n"))
            .map_err(|err| DnaError::Mail(format!("write failed: {err}")))
    }

    /// Read one (possibly multiline) reply, returning its code.
    fn read_reply(&mut self) -> Result<u16> {
        loop {
            let mut line = String::new();
            let n = self
                .reader
                .read_line(&mut line)
                .map_err(|err| DnaError::Mail(format!("read failed: {err}")))?;
            if n == 0 {
                return Err(DnaError::Mail("connection closed".to_string()));
            }
            if line.len() < 4 {
                return Err(DnaError::Mail(format!("short reply: {line:?}")));
            }
            let code: u16 = line[..3]
                .parse()
                .map_err(|_| DnaError::Mail(format!("bad reply: {line:?}")))?;
            // `250-...` continues a multiline reply; `250 ...` ends it.
            if line.as_bytes()[3] != b'-' {
                return Ok(code);
            }
        }
    }

    fn expect_reply(&mut self, expected: u16) -> Result<()> {
        let code = self.read_reply()?;
        if code != expected {
            return Err(DnaError::Mail(format!("expected {expected}, got {code}")));
        }
        Ok(())
    }

    fn command(&mut self, line: &str, expected: u16) -> Result<()> {
        self.write_line(line)?;
        self.expect_reply(expected)
    }
}

impl MailTransport for SmtpTransport {
    fn send(&mut self, recipients: &[String], from: &str, subject: &str, body: &str) -> Result<()> {
        if recipients.is_empty() {
            return Err(DnaError::Mail("no recipients".to_string()));
        }
        self.command(&format!("MAIL FROM:<{from}>"), 250)?;
        for recipient in recipients {
            self.command(&format!("RCPT TO:<{recipient}>"), 250)?;
        }
        self.command("DATA", 354)?;

        self.write_line(&format!("To: {}", recipients.join(", ")))?;
        self.write_line(&format!("From: {from}"))?;
        self.write_line(&format!("Subject: {subject}"))?;
        self.write_line("")?;
        for line in body.lines() {
            // Dot-stuffing per RFC 5321 §4.5.2.
            if let Some(rest) = line.strip_prefix('.') {
                self.write_line(&format!("..{rest}"))?;
            } else {
                self.write_line(line)?;
            }
        }
        self.command(".", 250)?;
        info!("notification sent to {}", recipients.join(", "));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::net::TcpListener;
    use std::path::PathBuf;
    use std::sync::mpsc;
    use std::thread;

    use pretty_assertions::assert_eq;

    use super::*;

    fn sample_request() -> ObsRequest {
        ObsRequest {
            id: 1,
            username: "astro".to_string(),
            user_id: 7,
            group_id: "g1".to_string(),
            observation_id: "o1".to_string(),
            num_exp: 3,
            completed: false,
            rts2_id: 4242,
            telescope: "Kuiper".to_string(),
            instrument: "Mont4k".to_string(),
            filter_name: "V".to_string(),
            exp_time: 30.0,
            ra_hms: "03:33:36.4".to_string(),
            dec_dms: "-36:08:25".to_string(),
            airmass: 1.2,
            object_name: "NGC 1365".to_string(),
        }
    }

    #[test]
    fn filter_branches() {
        let anyone = NotificationFilter::default();
        assert!(anyone.matches("astro@example.edu", "NGC 1365"));

        let by_user = NotificationFilter::new(Some("Astro".to_string()), None);
        assert!(by_user.matches("astro@example.edu", "whatever"));
        assert!(!by_user.matches("other@example.edu", "whatever"));

        let by_object = NotificationFilter::new(None, Some("ngc".to_string()));
        assert!(by_object.matches("anyone@example.edu", "NGC 1365"));
        assert!(!by_object.matches("anyone@example.edu", "M 31"));

        let both = NotificationFilter::new(Some("astro".to_string()), Some("1365".to_string()));
        assert!(both.matches("astro@example.edu", "NGC 1365"));
        assert!(!both.matches("astro@example.edu", "M 31"));
        assert!(!both.matches("other@example.edu", "NGC 1365"));
    }

    #[test]
    fn blank_filter_fields_are_unset() {
        let filter = NotificationFilter::new(Some("  ".to_string()), Some(String::new()));
        assert!(filter.matches("anyone@example.edu", "anything"));
    }

    #[test]
    fn composes_message_with_calibration_links() {
        let calibs = vec![(
            "bias".to_string(),
            PathBuf::from("/srv/files/Kuiper.Mont4k.20260806.bias.tgz"),
        )];
        let (subject, body) = compose_completion(
            &sample_request(),
            Path::new("/srv/files/Kuiper.Mont4k.20260806.astro.4242.tgz"),
            &calibs,
            "https://scopenet.as.arizona.edu/orp/files",
        );

        assert_eq!(subject, "ARTN ORP Completed NGC 1365");
        assert!(body.starts_with("NGC 1365 observed using the Kuiper telescope with Mont4k"));
        assert!(body.contains("RA: 03:33:36.4  Dec: -36:08:25  Epoch: J2000"));
        assert!(body.contains("3 x 30s exposures, in the V filter, at airmass 1.2"));
        assert!(body.contains(
            "Data archive: https://scopenet.as.arizona.edu/orp/files/Kuiper.Mont4k.20260806.astro.4242.tgz"
        ));
        assert!(body.contains(
            "Bias archive: https://scopenet.as.arizona.edu/orp/files/Kuiper.Mont4k.20260806.bias.tgz"
        ));
    }

    /// Minimal scripted SMTP peer: accepts one session, answers each
    /// command, and reports every received line.
    fn spawn_smtp_stub() -> (u16, mpsc::Receiver<String>) {
        let listener = TcpListener::bind("127.0.0.1:0").expect("bind");
        let port = listener.local_addr().expect("addr").port();
        let (tx, rx) = mpsc::channel();

        thread::spawn(move || {
            let (stream, _) = listener.accept().expect("accept");
            let mut reader = BufReader::new(stream.try_clone().expect("clone"));
            let mut writer = stream;
            writer.write_all(b"220 stub ready\r\n").expect("greet");

            let mut in_data = false;
            loop {
                let mut line = String::new();
                if reader.read_line(&mut line).unwrap_or(0) == 0 {
                    break;
                }
                let trimmed = line.trim_end().to_string();
                tx.send(trimmed.clone()).ok();

                if in_data {
                    if trimmed == "." {
                        in_data = false;
                        writer.write_all(b"250 accepted\r\n").expect("reply");
                    }
                    continue;
                }
                let reply: &[u8] = if trimmed.starts_with("EHLO") {
                    b"250-stub greets you\r\n250 OK\r\n"
                } else if trimmed == "DATA" {
                    in_data = true;
                    b"354 go ahead\r\n"
                } else if trimmed == "QUIT" {
                    writer.write_all(b"221 bye\r\n").ok();
                    break;
                } else {
                    b"250 OK\r\n"
                };
                writer.write_all(reply).expect("reply");
            }
        });

        (port, rx)
    }

    #[test]
    fn smtp_transport_speaks_the_wire_protocol() {
        let (port, rx) = spawn_smtp_stub();
        let config = SmtpConfig {
            host: "127.0.0.1".to_string(),
            port,
            username: "dna@observatory".to_string(),
            password: None,
        };

        let mut transport = SmtpTransport::connect(&config).expect("connect");
        transport
            .send(
                &["astro@example.edu".to_string(), "dna@observatory".to_string()],
                "dna@observatory",
                "ARTN ORP Completed NGC 1365",
                "line one\n.starts with a dot",
            )
            .expect("send");
        transport.quit();

        let received: Vec<String> = rx.iter().collect();
        assert!(received.contains(&"EHLO dna".to_string()));
        assert!(received.contains(&"MAIL FROM:<dna@observatory>".to_string()));
        assert!(received.contains(&"RCPT TO:<astro@example.edu>".to_string()));
        assert!(received.contains(&"Subject: ARTN ORP Completed NGC 1365".to_string()));
        // Dot-stuffed payload line.
        assert!(received.contains(&"..starts with a dot".to_string()));
        assert!(received.contains(&"QUIT".to_string()));
    }
}
