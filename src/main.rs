//! Server-side includes CGI program
//!
//! Reads the document named by `PATH_TRANSLATED` and streams it to standard output as
//! `text/html`, expanding `<!--#directive tag="value" ... -->` comments on the way.
//!
//! Supported directives: config, include, echo, fsize, flastmod.

use chrono::format::{Item, StrftimeItems};
use chrono::{DateTime, Local, TimeZone, Utc};
use clap::Parser;
use glob::Pattern;
use std::env;
use std::ffi::OsString;
use std::fmt::{self, Display, Write as FmtWrite};
use std::fs::{self, File};
use std::io::{self, BufRead, BufReader, BufWriter, Write};
use std::process::ExitCode;
use std::time::SystemTime;
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

const CONTENT_TYPE_HEADER: &str = "Content-type: text/html\n\n";

const DEFAULT_TIME_FORMAT: &str = "%a %b %e %T %Z %Y";
const DEFAULT_ERROR_MARKER: &str = "[an error occurred while processing this directive]";
const DEFAULT_MAX_INCLUDE_DEPTH: usize = 16;

// Bounded buffers. Anything past these limits is truncated or dropped.
const TIME_FORMAT_CAPACITY: usize = 99;
const COMMENT_CAPACITY: usize = 999;
const MAX_ATTRIBUTES: usize = 200;
const PATH_CAPACITY: usize = 1000;

const AUTH_FILE_NAME: &str = match option_env!("SSI_AUTH_FILE") {
    Some(name) => name,
    None => ".htpasswd",
};
const DEFAULT_CGI_PATTERN: &str = match option_env!("SSI_CGI_PATTERN") {
    Some(pattern) => pattern,
    None => "*/cgi-bin/*|*.cgi",
};

// Consumed at startup; never visible to `echo`.
const SILENT_ERRORS_VAR: &str = "SILENT_ERRORS";

const WHITESPACE: [char; 4] = [' ', '\t', '\n', '\r'];

#[derive(Parser, Debug)]
#[command(
    author,
    version,
    about = "Server-side includes expander for CGI requests",
    long_about = "Reads the document named by PATH_TRANSLATED and writes it to standard output as text/html, expanding config, include, echo, fsize and flastmod directives."
)]
struct Args {
    /// Maximum nesting of include directives below the requested document.
    #[arg(long, env = "SSI_MAX_INCLUDE_DEPTH", default_value = "16")]
    max_include_depth: usize,

    #[arg(long, env = "SSI_VERBOSE")]
    verbose: bool,
}

impl Default for Args {
    fn default() -> Self {
        Args {
            max_include_depth: DEFAULT_MAX_INCLUDE_DEPTH,
            verbose: false,
        }
    }
}

/// Read-only view of the request environment and the wall clock.
trait Environment {
    fn var(&self, name: &str) -> Option<String>;
    fn now(&self) -> DateTime<Utc>;
}

struct ProcessEnvironment;

impl Environment for ProcessEnvironment {
    fn var(&self, name: &str) -> Option<String> {
        // env::var_os panics on these names.
        if name.is_empty() || name.contains(['=', '\0']) {
            return None;
        }
        env::var_os(name).map(|value| value.to_string_lossy().into_owned())
    }

    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Fatal request errors. Each one replaces the document with an error page.
#[derive(Debug, thiserror::Error)]
enum SsiError {
    #[error("Couldn't get {0} environment variable.")]
    MissingVariable(&'static str),

    #[error("Invalid CGI pattern {pattern:?}: {source}")]
    InvalidCgiPattern {
        pattern: String,
        source: glob::PatternError,
    },

    #[error("The requested server-side includes filename, {0}, is not allowed.")]
    Forbidden(String),

    #[error("The requested server-side includes filename, {path}, does not seem to exist.")]
    NotFound { path: String, source: io::Error },

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl SsiError {
    /// Status line for the error page, or `None` once the document has started streaming.
    fn status(&self) -> Option<&'static str> {
        match self {
            SsiError::MissingVariable(_) | SsiError::InvalidCgiPattern { .. } => {
                Some("500 Internal Error")
            }
            SsiError::Forbidden(_) => Some("403 Forbidden"),
            SsiError::NotFound { .. } => Some("404 Not Found"),
            SsiError::Io(_) => None,
        }
    }
}

/// Non-fatal errors raised while executing a single directive attribute.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
enum DirectiveError {
    #[error("tried to use an unknown directive, {directive}")]
    UnknownDirective { directive: String },

    #[error("tried to use directive {directive} with an unknown tag, {tag}")]
    UnknownTag {
        directive: DirectiveKind,
        tag: String,
    },

    #[error("tried to use directive {directive} {tag} with an unknown value, {value}")]
    UnknownValue {
        directive: DirectiveKind,
        tag: String,
        value: String,
    },

    #[error("the filename requested in the {directive} {tag}={value} directive is not allowed")]
    NotPermitted {
        directive: DirectiveKind,
        tag: String,
        value: String,
    },

    #[error("the filename requested in a {directive} {tag} directive, {path}, does not seem to exist")]
    NotFound {
        directive: DirectiveKind,
        tag: String,
        path: String,
    },

    #[error("cannot resolve {directive} {tag}={value}: {reason}")]
    Unresolvable {
        directive: DirectiveKind,
        tag: String,
        value: String,
        reason: &'static str,
    },

    #[error("include of {path} exceeds the maximum include depth of {limit}")]
    DepthExceeded { path: String, limit: usize },
}

impl DirectiveError {
    fn shows_marker(&self) -> bool {
        !matches!(self, DirectiveError::Unresolvable { .. })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SizeFormat {
    Bytes,
    Abbrev,
}

/// Formatting state shared by every directive of a request, including nested documents.
#[derive(Debug, Clone, PartialEq, Eq)]
struct EngineConfig {
    time_format: String,
    size_format: SizeFormat,
    error_marker: Option<String>,
}

impl EngineConfig {
    fn new(silent_errors: bool) -> Self {
        EngineConfig {
            time_format: DEFAULT_TIME_FORMAT.to_string(),
            size_format: SizeFormat::Bytes,
            error_marker: (!silent_errors).then(|| DEFAULT_ERROR_MARKER.to_string()),
        }
    }

    fn set_time_format(&mut self, format: &str) {
        self.time_format = truncate_at_boundary(format, TIME_FORMAT_CAPACITY).to_string();
    }
}

fn truncate_at_boundary(s: &str, max_len: usize) -> &str {
    if s.len() <= max_len {
        return s;
    }
    let mut end = max_len;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}

fn format_size(size: u64, format: SizeFormat) -> String {
    const KIB: u64 = 1024;
    const MIB: u64 = KIB * 1024;
    const GIB: u64 = MIB * 1024;

    match format {
        SizeFormat::Bytes => size.to_string(),
        SizeFormat::Abbrev if size < KIB => size.to_string(),
        SizeFormat::Abbrev if size < MIB => format!("{}K", size / KIB),
        SizeFormat::Abbrev if size < GIB => format!("{}M", size / MIB),
        SizeFormat::Abbrev => format!("{}G", size / GIB),
    }
}

/// Renders `time` with a strftime-style format. Unparseable formats render as nothing.
fn format_time<Tz>(time: &DateTime<Tz>, format: &str) -> String
where
    Tz: TimeZone,
    Tz::Offset: Display,
{
    let items: Vec<Item<'_>> = StrftimeItems::new(format).collect();
    if items.iter().any(|item| matches!(item, Item::Error)) {
        return String::new();
    }
    let mut rendered = String::new();
    if write!(rendered, "{}", time.format_with_items(items.iter())).is_err() {
        return String::new();
    }
    rendered
}

fn format_local_time(time: SystemTime, format: &str) -> String {
    format_time(&DateTime::<Local>::from(time), format)
}

/// Leading alphabetic name of a POSIX `TZ` value (`UTC`, `EST5EDT` -> `EST`).
/// Zoneinfo paths (`Europe/Oslo`, `:/etc/localtime`) carry no abbreviation.
fn zone_abbreviation(tz: &str) -> Option<&str> {
    if tz.starts_with(':') || tz.contains('/') {
        return None;
    }
    let end = tz
        .find(|c: char| !c.is_ascii_alphabetic())
        .unwrap_or(tz.len());
    (end >= 3).then(|| &tz[..end])
}

fn substitute_zone_name(format: &str, zone: &str) -> String {
    let mut substituted = String::with_capacity(format.len() + zone.len());
    let mut chars = format.chars();
    while let Some(c) = chars.next() {
        if c != '%' {
            substituted.push(c);
            continue;
        }
        match chars.next() {
            Some('Z') => substituted.push_str(zone),
            Some(next) => {
                substituted.push('%');
                substituted.push(next);
            }
            None => substituted.push('%'),
        }
    }
    substituted
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DirectiveKind {
    Config,
    Include,
    Echo,
    Fsize,
    Flastmod,
}

impl DirectiveKind {
    fn from_name(name: &str) -> Option<Self> {
        match name {
            "config" => Some(DirectiveKind::Config),
            "include" => Some(DirectiveKind::Include),
            "echo" => Some(DirectiveKind::Echo),
            "fsize" => Some(DirectiveKind::Fsize),
            "flastmod" => Some(DirectiveKind::Flastmod),
            _ => None,
        }
    }

    fn name(self) -> &'static str {
        match self {
            DirectiveKind::Config => "config",
            DirectiveKind::Include => "include",
            DirectiveKind::Echo => "echo",
            DirectiveKind::Fsize => "fsize",
            DirectiveKind::Flastmod => "flastmod",
        }
    }
}

impl Display for DirectiveKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct Attribute {
    tag: String,
    value: String,
}

impl Attribute {
    /// Splits `tag=value` on the first `=`, dropping one pair of surrounding quotes from the value.
    fn from_chunk(chunk: &str) -> Self {
        let (tag, value) = chunk.split_once('=').unwrap_or((chunk, ""));
        // A lone `"` counts as both quotes and leaves an empty value.
        let value = if value.starts_with('"') && value.ends_with('"') {
            value.get(1..value.len() - 1).unwrap_or("")
        } else {
            value
        };
        Attribute {
            tag: tag.to_string(),
            value: value.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct Directive {
    kind: DirectiveKind,
    attributes: Vec<Attribute>,
}

impl Directive {
    fn parse(text: &str) -> Result<Self, DirectiveError> {
        let (name, chunks) = tokenize(text);
        let kind = DirectiveKind::from_name(name).ok_or_else(|| DirectiveError::UnknownDirective {
            directive: name.to_string(),
        })?;
        Ok(Directive {
            kind,
            attributes: chunks.into_iter().map(Attribute::from_chunk).collect(),
        })
    }
}

/// Splits directive text into the directive name and at most `MAX_ATTRIBUTES` attribute chunks.
///
/// Chunks are separated by whitespace. A `"` pulls everything up to the next `"` into the
/// current chunk, and the chunk ends right after the closing quote. There is no escaping.
fn tokenize(text: &str) -> (&str, Vec<&str>) {
    let text = text.trim_start_matches(WHITESPACE);
    let bytes = text.as_bytes();
    let mut chunks = Vec::new();
    let mut name = None;
    let mut start = 0;
    let mut pos = 0;

    loop {
        let Some(offset) = bytes[pos..]
            .iter()
            .position(|&b| matches!(b, b' ' | b'\t' | b'\n' | b'\r' | b'"'))
        else {
            push_chunk(&mut name, &mut chunks, &text[start..]);
            break;
        };
        let delimiter = pos + offset;
        let end = if bytes[delimiter] == b'"' {
            match bytes[delimiter + 1..].iter().position(|&b| b == b'"') {
                Some(close) => delimiter + 1 + close + 1,
                None => bytes.len(),
            }
        } else {
            delimiter
        };
        push_chunk(&mut name, &mut chunks, &text[start..end]);

        let rest = text[end..].trim_start_matches(WHITESPACE);
        if rest.is_empty() {
            break;
        }
        start = text.len() - rest.len();
        pos = start;
    }

    (name.unwrap_or(""), chunks)
}

fn push_chunk<'a>(name: &mut Option<&'a str>, chunks: &mut Vec<&'a str>, chunk: &'a str) {
    if name.is_none() {
        *name = Some(chunk);
    } else if !chunk.is_empty() && chunks.len() < MAX_ATTRIBUTES {
        chunks.push(chunk);
    }
}

/// Joins `name` onto the directory part of `path`, keeping exactly one `/` between them.
fn join_with_directory(path: &str, name: &str) -> String {
    match path.rfind('/') {
        Some(slash) => format!("{}{}", &path[..=slash], name),
        None => format!("/{name}"),
    }
}

/// Turns a `virtual=` or `file=` attribute into a filesystem path next to the current document.
fn resolve(
    virtual_path: &str,
    real_path: &str,
    directive: DirectiveKind,
    tag: &str,
    value: &str,
) -> Result<String, DirectiveError> {
    let not_permitted = || DirectiveError::NotPermitted {
        directive,
        tag: tag.to_string(),
        value: value.to_string(),
    };
    let unresolvable = |reason| DirectiveError::Unresolvable {
        directive,
        tag: tag.to_string(),
        value: value.to_string(),
        reason,
    };

    let resolved = match tag {
        "virtual" => {
            if value.contains("../") {
                return Err(not_permitted());
            }
            let root = real_path
                .strip_suffix(virtual_path)
                .ok_or_else(|| unresolvable("document root cannot be determined"))?;
            format!("{root}{value}")
        }
        "file" => {
            if value.starts_with('/') || value.contains("../") {
                return Err(not_permitted());
            }
            join_with_directory(real_path, value)
        }
        _ => {
            return Err(DirectiveError::UnknownTag {
                directive,
                tag: tag.to_string(),
            })
        }
    };

    if resolved.len() >= PATH_CAPACITY {
        return Err(unresolvable("path too long"));
    }
    Ok(resolved)
}

/// Vets every path before it is opened or stat'ed.
struct SecurityGate {
    cgi_patterns: Vec<Pattern>,
}

impl SecurityGate {
    fn from_env<E: Environment>(env: &E) -> Result<Self, SsiError> {
        let pattern = env
            .var("CGI_PATTERN")
            .unwrap_or_else(|| DEFAULT_CGI_PATTERN.to_string());
        SecurityGate::with_cgi_pattern(&pattern)
            .map_err(|source| SsiError::InvalidCgiPattern { pattern, source })
    }

    /// Compiles a `|`-separated list of server-style wildcard alternatives.
    fn with_cgi_pattern(pattern: &str) -> Result<Self, glob::PatternError> {
        let cgi_patterns = pattern
            .split('|')
            .filter(|alternative| !alternative.is_empty())
            .map(|alternative| Pattern::new(&collapse_recursive_wildcards(alternative)))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(SecurityGate { cgi_patterns })
    }

    fn permits(&self, path: &str) -> bool {
        if path.contains("../") {
            return false;
        }
        if is_auth_file(path) || directory_has_auth_file(path) {
            return false;
        }
        !self.cgi_patterns.iter().any(|pattern| pattern.matches(path))
    }
}

// Server patterns write `**` for "any run, including `/`". With default match
// options a single glob `*` already crosses separators.
fn collapse_recursive_wildcards(alternative: &str) -> String {
    let mut collapsed = String::with_capacity(alternative.len());
    for c in alternative.chars() {
        if c == '*' && collapsed.ends_with('*') {
            continue;
        }
        collapsed.push(c);
    }
    collapsed
}

fn is_auth_file(path: &str) -> bool {
    path == AUTH_FILE_NAME
        || path
            .strip_suffix(AUTH_FILE_NAME)
            .is_some_and(|head| head.ends_with('/'))
}

// CGI programs never see the Authorization header, so anything next to an
// auth file is refused outright.
fn directory_has_auth_file(path: &str) -> bool {
    let directory = path.rfind('/').map_or(".", |slash| &path[..slash]);
    fs::metadata(format!("{directory}/{AUTH_FILE_NAME}")).is_ok()
}

/// A document being scanned: its request path, filesystem path and open stream.
struct Document {
    virtual_path: String,
    real_path: String,
    reader: BufReader<File>,
}

impl Document {
    fn open(virtual_path: String, real_path: String) -> io::Result<Self> {
        let file = File::open(&real_path)?;
        if !file.metadata()?.is_file() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "not a regular file",
            ));
        }
        Ok(Document {
            virtual_path,
            real_path,
            reader: BufReader::new(file),
        })
    }

    fn next_byte(&mut self) -> io::Result<Option<u8>> {
        let Some(&byte) = self.reader.fill_buf()?.first() else {
            return Ok(None);
        };
        self.reader.consume(1);
        Ok(Some(byte))
    }

    /// Copies bytes to `out` up to the next `<`, which is left unread. Returns false at end of stream.
    fn copy_until_tag<W: Write>(&mut self, out: &mut W) -> io::Result<bool> {
        loop {
            let buffer = self.reader.fill_buf()?;
            if buffer.is_empty() {
                return Ok(false);
            }
            match buffer.iter().position(|&b| b == b'<') {
                Some(pos) => {
                    out.write_all(&buffer[..pos])?;
                    self.reader.consume(pos);
                    return Ok(true);
                }
                None => {
                    let len = buffer.len();
                    out.write_all(buffer)?;
                    self.reader.consume(len);
                }
            }
        }
    }

    fn modified(&self) -> io::Result<SystemTime> {
        self.reader.get_ref().metadata()?.modified()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ScanState {
    Ground,
    LessThan,
    Bang,
    Dash1,
    Dash2,
}

impl ScanState {
    fn withheld(self) -> &'static [u8] {
        match self {
            ScanState::Ground => b"",
            ScanState::LessThan => b"<",
            ScanState::Bang => b"<!",
            ScanState::Dash1 => b"<!-",
            ScanState::Dash2 => b"<!--",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CommentState {
    Ground,
    Dash1,
    Dash2,
}

/// Drives the scan of one request. Configuration changes made by `config` stay in effect
/// for every later directive, across include boundaries in both directions.
struct Engine<'e, E: Environment> {
    env: &'e E,
    config: EngineConfig,
    gate: SecurityGate,
    max_include_depth: usize,
    diagnostics: Vec<DirectiveError>,
}

impl<'e, E: Environment> Engine<'e, E> {
    fn new(env: &'e E, gate: SecurityGate, config: EngineConfig, max_include_depth: usize) -> Self {
        Engine {
            env,
            config,
            gate,
            max_include_depth,
            diagnostics: Vec::new(),
        }
    }

    /// Streams `doc` to `out`, executing directives. `depth` counts enclosing includes.
    fn scan<W: Write>(&mut self, doc: &mut Document, out: &mut W, depth: usize) -> io::Result<()> {
        let mut state = ScanState::Ground;
        loop {
            if state == ScanState::Ground && !doc.copy_until_tag(out)? {
                return Ok(());
            }
            // A half-matched `<!--` at end of stream is dropped.
            let Some(byte) = doc.next_byte()? else {
                return Ok(());
            };
            state = match (state, byte) {
                (ScanState::Ground, b'<') => ScanState::LessThan,
                (ScanState::LessThan, b'!') => ScanState::Bang,
                (ScanState::Bang, b'-') => ScanState::Dash1,
                (ScanState::Dash1, b'-') => ScanState::Dash2,
                (ScanState::Dash2, b'#') => {
                    self.capture_comment(doc, out, depth)?;
                    ScanState::Ground
                }
                (pending, _) => {
                    out.write_all(pending.withheld())?;
                    out.write_all(&[byte])?;
                    ScanState::Ground
                }
            };
        }
    }

    /// Consumes the rest of a directive comment up to `-->` and executes it.
    fn capture_comment<W: Write>(
        &mut self,
        doc: &mut Document,
        out: &mut W,
        depth: usize,
    ) -> io::Result<()> {
        let mut text = Vec::with_capacity(COMMENT_CAPACITY);
        let mut state = CommentState::Ground;
        while let Some(byte) = doc.next_byte()? {
            state = match (state, byte) {
                (CommentState::Dash2, b'>') => {
                    text.truncate(text.len().saturating_sub(2));
                    let text = String::from_utf8_lossy(&text).into_owned();
                    return self.dispatch(doc, out, depth, &text);
                }
                (CommentState::Ground, b'-') => CommentState::Dash1,
                (CommentState::Dash1 | CommentState::Dash2, b'-') => CommentState::Dash2,
                _ => CommentState::Ground,
            };
            if text.len() < COMMENT_CAPACITY {
                text.push(byte);
            }
        }
        debug!(document = %doc.real_path, "unterminated directive comment abandoned");
        Ok(())
    }

    fn dispatch<W: Write>(
        &mut self,
        doc: &Document,
        out: &mut W,
        depth: usize,
        text: &str,
    ) -> io::Result<()> {
        let directive = match Directive::parse(text) {
            Ok(directive) => directive,
            Err(err) => return self.report(doc, out, err),
        };
        for (index, attribute) in directive.attributes.iter().enumerate() {
            if index > 0 {
                out.write_all(b" ")?;
            }
            match directive.kind {
                DirectiveKind::Config => self.handle_config(doc, out, attribute)?,
                DirectiveKind::Include => self.handle_include(doc, out, depth, attribute)?,
                DirectiveKind::Echo => self.handle_echo(doc, out, attribute)?,
                DirectiveKind::Fsize => self.handle_fsize(doc, out, attribute)?,
                DirectiveKind::Flastmod => self.handle_flastmod(doc, out, attribute)?,
            }
        }
        Ok(())
    }

    fn handle_config<W: Write>(
        &mut self,
        doc: &Document,
        out: &mut W,
        attribute: &Attribute,
    ) -> io::Result<()> {
        let Attribute { tag, value } = attribute;
        match tag.as_str() {
            "timefmt" => self.config.set_time_format(value),
            "sizefmt" => match value.as_str() {
                "bytes" => self.config.size_format = SizeFormat::Bytes,
                "abbrev" => self.config.size_format = SizeFormat::Abbrev,
                _ => {
                    let err = DirectiveError::UnknownValue {
                        directive: DirectiveKind::Config,
                        tag: tag.clone(),
                        value: value.clone(),
                    };
                    return self.report(doc, out, err);
                }
            },
            "errmsg" => self.config.error_marker = Some(value.clone()),
            _ => {
                let err = DirectiveError::UnknownTag {
                    directive: DirectiveKind::Config,
                    tag: tag.clone(),
                };
                return self.report(doc, out, err);
            }
        }
        Ok(())
    }

    fn handle_include<W: Write>(
        &mut self,
        doc: &Document,
        out: &mut W,
        depth: usize,
        attribute: &Attribute,
    ) -> io::Result<()> {
        let real_path = match self.locate(doc, DirectiveKind::Include, attribute) {
            Ok(path) => path,
            Err(err) => return self.report(doc, out, err),
        };
        if depth >= self.max_include_depth {
            let err = DirectiveError::DepthExceeded {
                path: real_path,
                limit: self.max_include_depth,
            };
            return self.report(doc, out, err);
        }

        let virtual_path = nested_virtual_path(&doc.virtual_path, &real_path, attribute);
        let mut nested = match Document::open(virtual_path, real_path.clone()) {
            Ok(nested) => nested,
            Err(source) => {
                debug!(path = %real_path, %source, "include target could not be opened");
                let err = DirectiveError::NotFound {
                    directive: DirectiveKind::Include,
                    tag: attribute.tag.clone(),
                    path: real_path,
                };
                return self.report(doc, out, err);
            }
        };
        debug!(
            virtual_path = %nested.virtual_path,
            real_path = %nested.real_path,
            depth = depth + 1,
            "including document"
        );
        self.scan(&mut nested, out, depth + 1)
    }

    fn handle_echo<W: Write>(
        &mut self,
        doc: &Document,
        out: &mut W,
        attribute: &Attribute,
    ) -> io::Result<()> {
        if attribute.tag != "var" {
            let err = DirectiveError::UnknownTag {
                directive: DirectiveKind::Echo,
                tag: attribute.tag.clone(),
            };
            return self.report(doc, out, err);
        }

        let rendered = match attribute.value.as_str() {
            "DOCUMENT_NAME" => doc.real_path.clone(),
            "DOCUMENT_URI" => doc.virtual_path.clone(),
            "QUERY_STRING_UNESCAPED" => self.env.var("QUERY_STRING").unwrap_or_default(),
            "DATE_LOCAL" => format_time(
                &self.env.now().with_timezone(&Local),
                &self.local_time_format(),
            ),
            "DATE_GMT" => format_time(&self.env.now(), &self.config.time_format),
            "LAST_MODIFIED" => doc
                .modified()
                .map(|time| format_local_time(time, &self.local_time_format()))
                .unwrap_or_default(),
            name => match self.env.var(name).filter(|_| name != SILENT_ERRORS_VAR) {
                Some(value) => value,
                None => {
                    let err = DirectiveError::UnknownValue {
                        directive: DirectiveKind::Echo,
                        tag: attribute.tag.clone(),
                        value: attribute.value.clone(),
                    };
                    return self.report(doc, out, err);
                }
            },
        };
        out.write_all(rendered.as_bytes())
    }

    fn handle_fsize<W: Write>(
        &mut self,
        doc: &Document,
        out: &mut W,
        attribute: &Attribute,
    ) -> io::Result<()> {
        match self.stat(doc, DirectiveKind::Fsize, attribute) {
            Ok(metadata) => {
                out.write_all(format_size(metadata.len(), self.config.size_format).as_bytes())
            }
            Err(err) => self.report(doc, out, err),
        }
    }

    fn handle_flastmod<W: Write>(
        &mut self,
        doc: &Document,
        out: &mut W,
        attribute: &Attribute,
    ) -> io::Result<()> {
        let modified = self
            .stat(doc, DirectiveKind::Flastmod, attribute)
            .map(|metadata| metadata.modified());
        match modified {
            Ok(Ok(time)) => {
                out.write_all(format_local_time(time, &self.local_time_format()).as_bytes())
            }
            Ok(Err(source)) => {
                debug!(%source, "modification time unavailable");
                Ok(())
            }
            Err(err) => self.report(doc, out, err),
        }
    }

    /// The configured time format with `%Z` spelled as the `TZ` zone name, when one is set.
    /// Otherwise `%Z` renders as the numeric offset.
    fn local_time_format(&self) -> String {
        match self.env.var("TZ").as_deref().and_then(zone_abbreviation) {
            Some(zone) => substitute_zone_name(&self.config.time_format, zone),
            None => self.config.time_format.clone(),
        }
    }

    /// Resolves an attribute to a path and runs it through the security gate.
    fn locate(
        &self,
        doc: &Document,
        directive: DirectiveKind,
        attribute: &Attribute,
    ) -> Result<String, DirectiveError> {
        let path = resolve(
            &doc.virtual_path,
            &doc.real_path,
            directive,
            &attribute.tag,
            &attribute.value,
        )?;
        if !self.gate.permits(&path) {
            return Err(DirectiveError::NotPermitted {
                directive,
                tag: attribute.tag.clone(),
                value: path,
            });
        }
        Ok(path)
    }

    fn stat(
        &self,
        doc: &Document,
        directive: DirectiveKind,
        attribute: &Attribute,
    ) -> Result<fs::Metadata, DirectiveError> {
        let path = self.locate(doc, directive, attribute)?;
        fs::metadata(&path).map_err(|_| DirectiveError::NotFound {
            directive,
            tag: attribute.tag.clone(),
            path,
        })
    }

    /// Logs a directive error and writes the inline error marker, then lets the scan continue.
    fn report<W: Write>(
        &mut self,
        doc: &Document,
        out: &mut W,
        err: DirectiveError,
    ) -> io::Result<()> {
        warn!(
            document = %doc.real_path,
            "The requested server-side-includes filename, {}, {}.",
            doc.real_path,
            err
        );
        if err.shows_marker() {
            if let Some(marker) = &self.config.error_marker {
                out.write_all(marker.as_bytes())?;
            }
        }
        self.diagnostics.push(err);
        Ok(())
    }
}

/// Request path of an included document, falling back to its real path when too long.
fn nested_virtual_path(current_virtual: &str, real_path: &str, attribute: &Attribute) -> String {
    let candidate = if attribute.tag == "virtual" {
        attribute.value.clone()
    } else {
        join_with_directory(current_virtual, &attribute.value)
    };
    if candidate.len() < PATH_CAPACITY {
        candidate
    } else {
        real_path.to_string()
    }
}

struct Request {
    script_name: String,
    path_info: String,
    path_translated: String,
}

impl Request {
    fn from_env<E: Environment>(env: &E) -> Result<Self, SsiError> {
        let script_name = env
            .var("SCRIPT_NAME")
            .ok_or(SsiError::MissingVariable("SCRIPT_NAME"))?;
        let path_info = env.var("PATH_INFO").unwrap_or_default();
        let path_translated = env
            .var("PATH_TRANSLATED")
            .ok_or(SsiError::MissingVariable("PATH_TRANSLATED"))?;
        Ok(Request {
            script_name,
            path_info,
            path_translated,
        })
    }

    fn url(&self) -> String {
        format!("{}{}", self.script_name, self.path_info)
    }
}

fn escape_html(s: &str) -> String {
    let mut escaped = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '&' => escaped.push_str("&amp;"),
            '<' => escaped.push_str("&lt;"),
            '>' => escaped.push_str("&gt;"),
            '"' => escaped.push_str("&quot;"),
            _ => escaped.push(c),
        }
    }
    escaped
}

fn error_page_body(err: &SsiError) -> String {
    match err {
        SsiError::NotFound { path, .. } => format!(
            "The requested server-side includes filename, {},\ndoes not seem to exist.",
            escape_html(path)
        ),
        SsiError::Forbidden(path) => format!(
            "The requested server-side includes filename, {},\nis not allowed.",
            escape_html(path)
        ),
        other => format!(
            "Something unusual went wrong in a server-side includes request:\n<blockquote>\n{}\n</blockquote>\n",
            escape_html(&other.to_string())
        ),
    }
}

fn render_error_page<W: Write, E: Environment>(
    out: &mut W,
    env: &E,
    status: &str,
    err: &SsiError,
) -> io::Result<()> {
    let server_var = |name: &str| escape_html(&env.var(name).unwrap_or_default());
    write!(
        out,
        "<!DOCTYPE html>\n<html>\n <head>\n  <title>{status}</title>\n </head>\n <body>\n<h2>{status}</h2>\n<p>\n{}</p>\n<address>{} httpd at {} port {}</address>\n</body></html>\n",
        error_page_body(err),
        server_var("SERVER_SOFTWARE"),
        server_var("SERVER_NAME"),
        server_var("SERVER_PORT"),
    )
}

/// Writes the response header, then either the expanded document or an error page.
fn run<E: Environment, W: Write>(
    args: &Args,
    env: &E,
    out: &mut W,
) -> Result<Vec<DirectiveError>, SsiError> {
    out.write_all(CONTENT_TYPE_HEADER.as_bytes())?;
    match serve(args, env, out) {
        Ok(diagnostics) => Ok(diagnostics),
        Err(err) => {
            if let Some(status) = err.status() {
                render_error_page(out, env, status, &err)?;
            }
            Err(err)
        }
    }
}

fn serve<E: Environment, W: Write>(
    args: &Args,
    env: &E,
    out: &mut W,
) -> Result<Vec<DirectiveError>, SsiError> {
    let request = Request::from_env(env)?;
    let gate = SecurityGate::from_env(env)?;
    debug!(url = %request.url(), path = %request.path_translated, "serving request");

    if !gate.permits(&request.path_translated) {
        return Err(SsiError::Forbidden(request.path_translated));
    }
    let path = request.path_translated.clone();
    let mut document = Document::open(request.path_info, request.path_translated)
        .map_err(|source| SsiError::NotFound { path, source })?;

    let config = EngineConfig::new(env.var(SILENT_ERRORS_VAR).is_some());
    let mut engine = Engine::new(env, gate, config, args.max_include_depth);
    engine.scan(&mut document, out, 0)?;
    Ok(engine.diagnostics)
}

/// Reads settings from the environment only. Under CGI every argv word after the
/// program name comes from the client's query string.
fn parse_args<I, T>(args: I) -> (Args, usize, Option<clap::Error>)
where
    I: IntoIterator<Item = T>,
    T: Into<OsString> + Clone,
{
    let mut args = args.into_iter();
    let program: Vec<T> = args.by_ref().take(1).collect();
    let ignored = args.count();
    match Args::try_parse_from(program) {
        Ok(parsed) => (parsed, ignored, None),
        Err(err) => (Args::default(), ignored, Some(err)),
    }
}

fn init_tracing(verbose: bool) {
    let filter = if verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"))
    };
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .try_init();
}

fn run_with_args<I, T, E, W>(args: I, env: &E, out: &mut W) -> ExitCode
where
    I: IntoIterator<Item = T>,
    T: Into<OsString> + Clone,
    E: Environment,
    W: Write,
{
    let (args, ignored, config_error) = parse_args(args);
    init_tracing(args.verbose);
    if ignored > 0 {
        debug!(count = ignored, "ignoring command-line arguments");
    }
    if let Some(err) = config_error {
        warn!(kind = %err.kind(), "invalid settings in environment, using defaults");
    }

    let result = run(&args, env, out);
    let flushed = out.flush();
    match result {
        Ok(diagnostics) => {
            if !diagnostics.is_empty() {
                info!(count = diagnostics.len(), "request finished with directive errors");
            }
            match flushed {
                Ok(()) => ExitCode::SUCCESS,
                Err(err) => {
                    error!("failed to flush response: {err}");
                    ExitCode::FAILURE
                }
            }
        }
        Err(err) => {
            error!("{err}");
            ExitCode::FAILURE
        }
    }
}

fn main() -> ExitCode {
    let stdout = io::stdout();
    let mut out = BufWriter::new(stdout.lock());
    run_with_args(env::args_os(), &ProcessEnvironment, &mut out)
}
