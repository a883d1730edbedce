use std::{ffi::OsString, net::SocketAddr, path::PathBuf, time::Duration};

use clap::Parser;

use crate::encode::{BodyEncoding, EncodingPolicy, QuoteStyle};

#[derive(Debug, Clone, Parser)]
#[command(name = "licensetap", version, about)]
pub struct Config {
    /// Address the browser shim posts tab events and runtime messages to.
    #[arg(
        long = "bind",
        alias = "bind-addr",
        env = "LICENSETAP_BIND",
        value_name = "ADDR",
        default_value = "127.0.0.1:23518",
        help = "Bind address for browser event and message requests"
    )]
    pub bind_addr: SocketAddr,

    /// Shell dialect used when rendering the replay command.
    #[arg(
        long = "quote-style",
        env = "LICENSETAP_QUOTE_STYLE",
        value_enum,
        default_value_t = QuoteStyle::Single
    )]
    pub quote_style: QuoteStyle,

    /// Body representation(s) forwarded to the native host.
    #[arg(
        long = "body-encoding",
        env = "LICENSETAP_BODY_ENCODING",
        value_enum,
        default_value_t = BodyEncoding::Both
    )]
    pub body_encoding: BodyEncoding,

    /// Program spawned for each send, speaking native messaging on stdin/stdout.
    #[arg(long = "native-host", env = "LICENSETAP_NATIVE_HOST", value_name = "PROGRAM")]
    pub native_host: Option<PathBuf>,

    /// Extra argument passed to the native host program (repeatable).
    #[arg(long = "native-host-arg", value_name = "ARG", allow_hyphen_values = true)]
    pub native_host_args: Vec<OsString>,

    /// Seconds to wait for the native host to reply.
    #[arg(
        long = "native-timeout",
        env = "LICENSETAP_NATIVE_TIMEOUT",
        value_name = "SECS",
        default_value_t = 30
    )]
    pub native_timeout_secs: u64,

    /// Ask the receiving process to delete intermediate files after processing.
    #[arg(long = "delete-me", env = "LICENSETAP_DELETE_ME")]
    pub delete_me: bool,

    /// Upper bound on tabs tracked at once; the least recently touched is dropped.
    #[arg(
        long = "max-tabs",
        env = "LICENSETAP_MAX_TABS",
        value_name = "N",
        default_value_t = 256
    )]
    pub max_tabs: usize,

    /// Optional file path to dump raw browser events for debugging.
    #[arg(
        long = "debug-dump",
        env = "LICENSETAP_DEBUG_DUMP",
        value_name = "FILE",
        help = "Append each incoming browser event to FILE for offline inspection"
    )]
    pub debug_dump: Option<PathBuf>,

    /// Run without the terminal dashboard; logs go to stderr.
    #[arg(long, env = "LICENSETAP_HEADLESS")]
    pub headless: bool,

    /// Log destination while the dashboard owns the terminal.
    #[arg(
        long = "log-file",
        env = "LICENSETAP_LOG_FILE",
        value_name = "FILE",
        default_value = "licensetap.log"
    )]
    pub log_file: PathBuf,
}

impl Config {
    pub fn encoding_policy(&self) -> EncodingPolicy {
        EncodingPolicy {
            quote: self.quote_style,
            body: self.body_encoding,
        }
    }

    pub fn native_timeout(&self) -> Duration {
        Duration::from_secs(self.native_timeout_secs.max(1))
    }
}
