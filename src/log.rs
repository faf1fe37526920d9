//! Asynchronous logging with hot-reconfigurable debug filtering.
//!
//! The hot path never blocks on the output device: [`message`] performs a
//! cheap inclusion check, formats into a stack buffer and stages the entry
//! into a process-wide [`Fifo`](crate::fifo::Fifo); a dedicated forward
//! thread drains the FIFO, formats the final line and writes it to the
//! configured sink, rotating it when a size threshold is exceeded.
//!
//! Every module that logs embeds a [`LogSource`] via [`log_source!`] and
//! uses the [`log_error!`], [`log_warn!`], [`log_info!`] and [`log_debug!`]
//! macros. Debug messages carry a [debug group](DebugGroups) and are
//! subject to a per-source, per-line filter (see [`set_debug_filter`])
//! whose rule set is versioned: sources lazily re-evaluate their cached
//! filter state when the version moves, so a filter change needs no
//! explicit reinitialization anywhere.
//!
//! Timestamps are taken *before* the staging mutex is acquired, so under
//! contention lines can reach the FIFO in slightly non-monotonic timestamp
//! order; per-thread program order is always preserved.

use std::collections::HashMap;
use std::fmt::{self, Write as _};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::SystemTime;

use arc_swap::{ArcSwap, ArcSwapOption};
use bitflags::bitflags;
use chrono::{DateTime, Local};

use crate::conf_file::ConfFile;
use crate::error::{Error, Result};
use crate::fifo::Fifo;
use crate::io::{Io, Stderr};
use crate::sync::{Mutex, Thread};

/// Byte length of the ring buffer between the hot path and the forward
/// thread.
const FIFO_LENGTH: usize = 64 * 1024;

/// Formatted message bytes per entry, NUL terminator included.
pub const MAX_MESSAGE_LENGTH: usize = 1024;

/// Serialized size of an entry header in the FIFO.
const ENTRY_HEADER_LENGTH: usize = 24;

/// Sink size that triggers rotation when a rotate hook is installed.
pub const MAX_OUTPUT_SIZE: u64 = 5 * 1024 * 1024;

/// Entries between rotation checks after a rotation has happened.
const ROTATE_COUNTDOWN: u32 = 50;

/// Upper bound on parsed debug-filter rules.
const MAX_DEBUG_FILTER_RULES: usize = 64;

/// Upper bound on per-line filter overrides recorded per source; overflow
/// is silently dropped.
const MAX_SOURCE_LINES: usize = 16;

/// Severity of a log message. Lower levels are more severe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum LogLevel {
    /// The daemon cannot continue as intended.
    Error = 0,
    /// Something unexpected that the daemon works around.
    Warn = 1,
    /// Normal operational messages.
    Info = 2,
    /// Verbose diagnostics, subject to the debug filter.
    Debug = 3,
}

impl LogLevel {
    fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(Self::Error),
            1 => Some(Self::Warn),
            2 => Some(Self::Info),
            3 => Some(Self::Debug),
            _ => None,
        }
    }

    /// Parse a configuration value such as `"warn"`.
    #[must_use]
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "error" => Some(Self::Error),
            "warn" => Some(Self::Warn),
            "info" => Some(Self::Info),
            "debug" => Some(Self::Debug),
            _ => None,
        }
    }

    const fn tag(self) -> char {
        match self {
            Self::Error => 'E',
            Self::Warn => 'W',
            Self::Info => 'I',
            Self::Debug => 'D',
        }
    }
}

bitflags! {
    /// Coarse tags attached to debug messages for filtering.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct DebugGroups: u8 {
        /// Messages without a more specific group.
        const COMMON = 1;
        /// Event loop internals.
        const EVENT = 2;
        /// Packet dumps and per-packet processing.
        const PACKET = 4;
        /// Object lifecycle tracking.
        const OBJECT = 8;
        /// Messages forwarded from libusb.
        const LIBUSB = 16;
    }
}

impl DebugGroups {
    fn from_keyword(keyword: &str) -> Option<Self> {
        match keyword {
            "common" => Some(Self::COMMON),
            "event" => Some(Self::EVENT),
            "packet" => Some(Self::PACKET),
            "object" => Some(Self::OBJECT),
            "libusb" => Some(Self::LIBUSB),
            "all" => Some(Self::all()),
            _ => None,
        }
    }

    fn keyword(self) -> &'static str {
        match self {
            Self::COMMON => "common",
            Self::EVENT => "event",
            Self::PACKET => "packet",
            Self::OBJECT => "object",
            Self::LIBUSB => "libusb",
            _ => "unknown",
        }
    }
}

bitflags! {
    /// The outputs that will receive a log call; an empty mask means the
    /// call returns before formatting anything.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Inclusion: u8 {
        /// The configured sink.
        const PRIMARY = 1;
        /// A platform-defined secondary output (none on Unix).
        const SECONDARY = 2;
    }
}

#[derive(Debug, Clone, Copy)]
struct LineOverride {
    line: u32,
    groups: u8,
}

/// Per-module log source descriptor, embedded as a static by
/// [`log_source!`].
///
/// The display name (the file's basename) and the cached debug-filter
/// state are initialized lazily on first use; the cache is re-evaluated
/// whenever the process-wide filter version moves.
pub struct LogSource {
    file: &'static str,
    default_group: DebugGroups,
    name: OnceLock<&'static str>,
    epoch: AtomicU32,
    index: AtomicU32,
    version: AtomicU32,
    groups: AtomicU8,
    lines: Mutex<Vec<LineOverride>>,
}

impl LogSource {
    /// Create a source for `file` whose debug messages default to the
    /// `common` group.
    #[must_use]
    pub const fn new(file: &'static str) -> Self {
        Self::with_group(file, DebugGroups::COMMON)
    }

    /// Create a source for `file` with an explicit default debug group.
    #[must_use]
    pub const fn with_group(file: &'static str, default_group: DebugGroups) -> Self {
        Self {
            file,
            default_group,
            name: OnceLock::new(),
            epoch: AtomicU32::new(0),
            index: AtomicU32::new(0),
            version: AtomicU32::new(0),
            groups: AtomicU8::new(0),
            lines: Mutex::new(Vec::new()),
        }
    }

    /// The source's display name: the basename of its file.
    #[must_use]
    pub fn name(&self) -> &'static str {
        self.name.get_or_init(|| {
            let file = self.file;
            let file = file.rsplit('/').next().unwrap_or(file);

            file.rsplit('\\').next().unwrap_or(file)
        })
    }

    /// The default debug group of this source's messages.
    #[must_use]
    pub const fn default_group(&self) -> DebugGroups {
        self.default_group
    }

    fn debug_groups_for_line(&self, line: u32) -> DebugGroups {
        let lines = self.lines.lock();

        let bits = lines
            .iter()
            .find(|entry| entry.line == line)
            .map_or_else(|| self.groups.load(Ordering::Acquire), |entry| entry.groups);

        DebugGroups::from_bits_truncate(bits)
    }
}

/// Embed the module's [`LogSource`] static.
///
/// Invoke once per module that uses the logging macros, optionally naming
/// the default debug group of the module's debug messages:
///
/// ```ignore
/// log_source!();                // debug messages default to `common`
/// log_source!(group: Event);    // debug messages default to `event`
/// ```
#[macro_export]
macro_rules! log_source {
    () => {
        $crate::log_source!(group: Common);
    };
    (group: Common) => {
        $crate::log_source!(@imp $crate::log::DebugGroups::COMMON);
    };
    (group: Event) => {
        $crate::log_source!(@imp $crate::log::DebugGroups::EVENT);
    };
    (group: Packet) => {
        $crate::log_source!(@imp $crate::log::DebugGroups::PACKET);
    };
    (group: Object) => {
        $crate::log_source!(@imp $crate::log::DebugGroups::OBJECT);
    };
    (group: Libusb) => {
        $crate::log_source!(@imp $crate::log::DebugGroups::LIBUSB);
    };
    (@imp $group:expr) => {
        static _LOG_SOURCE: $crate::log::LogSource =
            $crate::log::LogSource::with_group(::core::file!(), $group);
    };
}

/// Resolve the name of the enclosing function.
#[doc(hidden)]
#[macro_export]
macro_rules! __log_function {
    () => {{
        fn __function() {}

        $crate::log::trim_function_name(::core::any::type_name_of_val(&__function))
    }};
}

/// Log at the error level.
#[macro_export]
macro_rules! log_error {
    ($($arg:tt)*) => {
        $crate::log::message(
            &_LOG_SOURCE,
            $crate::log::LogLevel::Error,
            _LOG_SOURCE.default_group(),
            ::core::line!(),
            $crate::__log_function!(),
            ::core::format_args!($($arg)*),
        );
    };
}

/// Log at the warn level.
#[macro_export]
macro_rules! log_warn {
    ($($arg:tt)*) => {
        $crate::log::message(
            &_LOG_SOURCE,
            $crate::log::LogLevel::Warn,
            _LOG_SOURCE.default_group(),
            ::core::line!(),
            $crate::__log_function!(),
            ::core::format_args!($($arg)*),
        );
    };
}

/// Log at the info level.
#[macro_export]
macro_rules! log_info {
    ($($arg:tt)*) => {
        $crate::log::message(
            &_LOG_SOURCE,
            $crate::log::LogLevel::Info,
            _LOG_SOURCE.default_group(),
            ::core::line!(),
            $crate::__log_function!(),
            ::core::format_args!($($arg)*),
        );
    };
}

/// Log at the debug level, in the module's default debug group or an
/// explicitly named one: `log_debug!(group: Packet, "...", ...)`.
#[macro_export]
macro_rules! log_debug {
    (group: Common, $($arg:tt)*) => {
        $crate::log_debug!(@imp $crate::log::DebugGroups::COMMON, $($arg)*);
    };
    (group: Event, $($arg:tt)*) => {
        $crate::log_debug!(@imp $crate::log::DebugGroups::EVENT, $($arg)*);
    };
    (group: Packet, $($arg:tt)*) => {
        $crate::log_debug!(@imp $crate::log::DebugGroups::PACKET, $($arg)*);
    };
    (group: Object, $($arg:tt)*) => {
        $crate::log_debug!(@imp $crate::log::DebugGroups::OBJECT, $($arg)*);
    };
    (group: Libusb, $($arg:tt)*) => {
        $crate::log_debug!(@imp $crate::log::DebugGroups::LIBUSB, $($arg)*);
    };
    (@imp $group:expr, $($arg:tt)*) => {
        $crate::log::message(
            &_LOG_SOURCE,
            $crate::log::LogLevel::Debug,
            $group,
            ::core::line!(),
            $crate::__log_function!(),
            ::core::format_args!($($arg)*),
        );
    };
    ($($arg:tt)*) => {
        $crate::log_debug!(@imp _LOG_SOURCE.default_group(), $($arg)*);
    };
}

crate::log_source!();

/// Strip the `__function` probe suffix and closure frames from a type
/// name, leaving the enclosing function's name.
#[doc(hidden)]
#[must_use]
pub fn trim_function_name(full: &'static str) -> &'static str {
    let mut name = full.strip_suffix("::__function").unwrap_or(full);

    while let Some(stripped) = name.strip_suffix("::{{closure}}") {
        name = stripped;
    }

    match name.rfind("::") {
        Some(position) => &name[position + 2..],
        None => name,
    }
}

/// Logger configuration, as read from a `.conf` file.
#[derive(Debug, Clone)]
pub struct Config {
    /// Most verbose level to emit; more verbose calls are discarded.
    pub level: LogLevel,
    /// Initial debug filter, applied on top of the level.
    pub debug_filter: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            level: LogLevel::Info,
            debug_filter: None,
        }
    }
}

impl Config {
    /// Read `log.level` and `log.debug_filter` from a parsed `.conf` file.
    ///
    /// Missing or malformed values silently keep their defaults, matching
    /// the policy that configuration warnings are a concern of the
    /// bootstrap's check mode, not of a running daemon.
    #[must_use]
    pub fn from_conf_file(conf_file: &ConfFile) -> Self {
        let level = conf_file
            .get("log.level")
            .and_then(LogLevel::from_name)
            .unwrap_or(LogLevel::Info);

        let debug_filter = conf_file
            .get("log.debug_filter")
            .filter(|value| !value.is_empty())
            .map(str::to_string);

        Self {
            level,
            debug_filter,
        }
    }
}

/// Swaps the sink when the size threshold is exceeded.
///
/// Receives the current sink and returns the replacement, optionally with
/// an informational message that is emitted through the normal output path
/// before logging continues. A failing hook disables output until
/// [`set_output`] installs a new sink.
pub type RotateHook =
    Box<dyn FnMut(Box<dyn Io + Send>) -> Result<(Box<dyn Io + Send>, Option<String>)> + Send>;

#[derive(Clone)]
struct FilterRule {
    included: bool,
    source_name: String,
    line: i64,
    groups: u8,
}

struct CommonState {
    rules: Vec<FilterRule>,
    function_indexes: HashMap<usize, u32>,
}

#[derive(Clone, Default)]
struct SourceTable {
    sources: Vec<&'static LogSource>,
    functions: Vec<&'static str>,
}

struct OutputState {
    sink: Option<Box<dyn Io + Send>>,
    color: bool,
    written: u64,
    rotate: Option<RotateHook>,
    countdown: u32,
}

struct LogState {
    epoch: u32,
    level: AtomicU8,
    debug_override: AtomicBool,
    filter_version: AtomicU32,
    common: Mutex<CommonState>,
    tables: ArcSwap<SourceTable>,
    fifo: Fifo,
    output: Mutex<OutputState>,
    enqueued: AtomicU64,
    emitted: AtomicU64,
    forward: Mutex<Option<Thread>>,
}

static STATE: ArcSwapOption<LogState> = ArcSwapOption::const_empty();
static EPOCH: AtomicU32 = AtomicU32::new(0);

fn sink_supports_color(sink: &dyn Io) -> bool {
    if !crate::io::is_tty(sink.handle()) {
        return false;
    }

    match std::env::var("TERM") {
        Ok(term) => term != "dumb",
        Err(_) => false,
    }
}

/// Initialize the process-wide logger and start the forward thread.
///
/// The sink starts out as standard error; use [`set_output`] to change it.
///
/// # Errors
///
/// Returns an error if the logger is already initialized.
pub fn init(config: &Config) -> Result<()> {
    if STATE.load().is_some() {
        return Err(Error::io("logger is already initialized"));
    }

    let epoch = EPOCH.fetch_add(1, Ordering::SeqCst) + 1;
    let sink: Box<dyn Io + Send> = Box::new(Stderr);
    let color = sink_supports_color(sink.as_ref());

    let state = Arc::new(LogState {
        epoch,
        level: AtomicU8::new(config.level as u8),
        debug_override: AtomicBool::new(false),
        filter_version: AtomicU32::new(0),
        common: Mutex::new(CommonState {
            rules: Vec::new(),
            function_indexes: HashMap::new(),
        }),
        tables: ArcSwap::from_pointee(SourceTable::default()),
        fifo: Fifo::new(FIFO_LENGTH),
        output: Mutex::new(OutputState {
            sink: Some(sink),
            color,
            written: 0,
            rotate: None,
            countdown: 0,
        }),
        enqueued: AtomicU64::new(0),
        emitted: AtomicU64::new(0),
        forward: Mutex::new(None),
    });

    let forward_state = Arc::clone(&state);
    *state.forward.lock() = Some(Thread::spawn("log-forward", move || {
        forward_loop(&forward_state);
    }));

    STATE.store(Some(Arc::clone(&state)));

    if let Some(filter) = config.debug_filter.as_deref() {
        set_debug_filter(filter);
    }

    Ok(())
}

/// Shut the logger down: stop accepting entries, drain the FIFO, join the
/// forward thread and drop the process-wide state.
pub fn exit() {
    let Some(state) = STATE.swap(None) else {
        return;
    };

    state.fifo.shutdown();

    let thread = state.forward.lock().take();

    if let Some(thread) = thread {
        thread.join();
    }
}

/// Replace the output sink; the byte counter restarts from the sink's
/// reported size.
pub fn set_output(sink: Box<dyn Io + Send>) {
    let Some(state) = STATE.load_full() else {
        return;
    };

    let mut output = state.output.lock();

    output.color = sink_supports_color(sink.as_ref());
    output.written = sink.status().map_or(0, |status| status.size);
    output.sink = Some(sink);
}

/// Install or clear the rotate hook. The rotation countdown is reset so
/// the next entry may trigger a size check.
pub fn set_rotate(rotate: Option<RotateHook>) {
    let Some(state) = STATE.load_full() else {
        return;
    };

    let mut output = state.output.lock();

    output.rotate = rotate;
    output.countdown = 0;
}

/// Change the configured level.
pub fn set_level(level: LogLevel) {
    if let Some(state) = STATE.load_full() {
        state.level.store(level as u8, Ordering::SeqCst);
    }
}

/// The level currently in effect: `debug` while the debug override is
/// active, the configured level otherwise.
#[must_use]
pub fn effective_level() -> LogLevel {
    let Some(state) = STATE.load_full() else {
        return LogLevel::Info;
    };

    if state.debug_override.load(Ordering::SeqCst) {
        LogLevel::Debug
    } else {
        LogLevel::from_u8(state.level.load(Ordering::SeqCst)).unwrap_or(LogLevel::Info)
    }
}

/// Force-enable debug output regardless of the configured level.
pub fn set_debug_override(debug_override: bool) {
    if let Some(state) = STATE.load_full() {
        state.debug_override.store(debug_override, Ordering::SeqCst);
    }
}

/// True while the debug override is active.
#[must_use]
pub fn debug_override() -> bool {
    STATE
        .load_full()
        .is_some_and(|state| state.debug_override.load(Ordering::SeqCst))
}

/// Toggle the debug override, returning the new setting. Suited as a
/// `SIGUSR1` hook.
pub fn toggle_debug_override() -> bool {
    let Some(state) = STATE.load_full() else {
        return false;
    };

    !state.debug_override.fetch_xor(true, Ordering::SeqCst)
}

/// Replace the debug filter.
///
/// The filter is a comma separated list of rules, each `+` (include) or
/// `-` (exclude) followed by a source basename or a group keyword
/// (`common`, `event`, `packet`, `object`, `libusb`, `all`), optionally
/// with a `:line` suffix. Malformed rules are dropped with a warning. The
/// rule set is versioned; every source re-evaluates its cached filter
/// state on its next inclusion check.
pub fn set_debug_filter(filter: &str) {
    let Some(state) = STATE.load_full() else {
        return;
    };

    let rules = parse_debug_filter(filter);

    let mut common = state.common.lock();

    common.rules = rules;
    state.filter_version.fetch_add(1, Ordering::SeqCst);
}

fn parse_debug_filter(filter: &str) -> Vec<FilterRule> {
    let mut rules = Vec::new();

    for statement in filter.split(',') {
        let statement = statement.trim();

        if statement.is_empty() {
            continue;
        }

        if rules.len() >= MAX_DEBUG_FILTER_RULES {
            crate::log_warn!(
                "Debug filter has too many rules, ignoring the rest starting at '{}'",
                statement
            );

            break;
        }

        let (included, body) = match statement.split_at(1) {
            ("+", body) => (true, body),
            ("-", body) => (false, body),
            _ => {
                crate::log_warn!(
                    "Debug filter rule '{}' does not start with '+' or '-'",
                    statement
                );

                continue;
            }
        };

        let (name, line) = match body.split_once(':') {
            Some((name, line_text)) => match line_text.parse::<u32>() {
                Ok(line) if (1..=99_999).contains(&line) => (name, i64::from(line)),
                _ => {
                    crate::log_warn!(
                        "Debug filter rule '{}' has an invalid line number",
                        statement
                    );

                    continue;
                }
            },
            None => (body, -1),
        };

        if name.is_empty() || name.len() > 64 {
            crate::log_warn!("Debug filter rule '{}' has an invalid name", statement);

            continue;
        }

        let name = name.to_ascii_lowercase();

        let rule = match DebugGroups::from_keyword(&name) {
            Some(groups) => FilterRule {
                included,
                source_name: String::new(),
                line,
                groups: groups.bits(),
            },
            None => FilterRule {
                included,
                source_name: name,
                line,
                groups: DebugGroups::all().bits(),
            },
        };

        rules.push(rule);
    }

    rules
}

fn upsert_line(lines: &mut Vec<LineOverride>, line: u32, groups: u8) {
    if let Some(entry) = lines.iter_mut().find(|entry| entry.line == line) {
        entry.groups = groups;
    } else if lines.len() < MAX_SOURCE_LINES {
        lines.push(LineOverride { line, groups });
    }
}

fn apply_debug_filter(rules: &[FilterRule], source: &'static LogSource) {
    let mut groups = DebugGroups::all().bits();
    let mut lines = source.lines.lock();

    lines.clear();

    for rule in rules {
        if rule.source_name.is_empty() {
            if rule.line < 0 {
                if rule.included {
                    groups |= rule.groups;
                } else {
                    groups &= !rule.groups;
                }

                for entry in lines.iter_mut() {
                    if rule.included {
                        entry.groups |= rule.groups;
                    } else {
                        entry.groups &= !rule.groups;
                    }
                }
            } else {
                // A group rule aimed at a single line adjusts that line's
                // override, starting from whatever the line inherits right
                // now.
                let line = rule.line as u32;
                let base = lines
                    .iter()
                    .find(|entry| entry.line == line)
                    .map_or(groups, |entry| entry.groups);

                let adjusted = if rule.included {
                    base | rule.groups
                } else {
                    base & !rule.groups
                };

                upsert_line(&mut lines, line, adjusted);
            }
        } else if rule.source_name.eq_ignore_ascii_case(source.name()) {
            let treatment = if rule.included {
                DebugGroups::all().bits()
            } else {
                0
            };

            if rule.line < 0 {
                groups = treatment;
            } else {
                upsert_line(&mut lines, rule.line as u32, treatment);
            }
        }
    }

    source.groups.store(groups, Ordering::Release);
}

fn attach_source(state: &LogState, common: &mut CommonState, source: &'static LogSource) {
    let version = state.filter_version.load(Ordering::SeqCst);

    if source.epoch.load(Ordering::Acquire) != state.epoch {
        let tables = state.tables.load_full();
        let mut updated = SourceTable::clone(&tables);

        updated.sources.push(source);
        source
            .index
            .store((updated.sources.len() - 1) as u32, Ordering::Release);

        state.tables.store(Arc::new(updated));

        source.name();
        apply_debug_filter(&common.rules, source);
        source.version.store(version, Ordering::Release);
        source.epoch.store(state.epoch, Ordering::Release);

        return;
    }

    if source.version.load(Ordering::Acquire) != version {
        apply_debug_filter(&common.rules, source);
        source.version.store(version, Ordering::Release);
    }
}

fn ensure_current(state: &LogState, source: &'static LogSource) {
    if source.epoch.load(Ordering::Acquire) != state.epoch
        || source.version.load(Ordering::Acquire) != state.filter_version.load(Ordering::SeqCst)
    {
        let mut common = state.common.lock();

        attach_source(state, &mut common, source);
    }
}

fn included_in_state(
    state: &LogState,
    source: &'static LogSource,
    level: LogLevel,
    group: DebugGroups,
    line: u32,
) -> Inclusion {
    let debug_override = state.debug_override.load(Ordering::SeqCst);
    let configured =
        LogLevel::from_u8(state.level.load(Ordering::SeqCst)).unwrap_or(LogLevel::Info);

    let mut inclusion = Inclusion::empty();

    if level <= configured || (debug_override && level == LogLevel::Debug) {
        inclusion |= Inclusion::PRIMARY;
    }

    if level == LogLevel::Debug && inclusion.contains(Inclusion::PRIMARY) {
        ensure_current(state, source);

        if !source.debug_groups_for_line(line).intersects(group) {
            inclusion -= Inclusion::PRIMARY;
        }
    }

    // Secondary output is platform defined; there is none on Unix.
    inclusion
}

/// The inclusion mask a log call with these parameters would get right
/// now: which outputs would receive it, or empty if it would be discarded
/// before formatting.
#[must_use]
pub fn is_included(
    source: &'static LogSource,
    level: LogLevel,
    group: DebugGroups,
    line: u32,
) -> Inclusion {
    let Some(state) = STATE.load_full() else {
        return Inclusion::empty();
    };

    included_in_state(&state, source, level, group, line)
}

struct MessageBuffer {
    bytes: [u8; MAX_MESSAGE_LENGTH],
    used: usize,
}

impl MessageBuffer {
    const fn new() -> Self {
        Self {
            bytes: [0; MAX_MESSAGE_LENGTH],
            used: 0,
        }
    }

    fn as_bytes_with_nul(&self) -> &[u8] {
        // The last byte of the buffer is never written, so there is always
        // room for the terminator.
        &self.bytes[..self.used + 1]
    }
}

impl fmt::Write for MessageBuffer {
    fn write_str(&mut self, text: &str) -> fmt::Result {
        // Truncate silently; an over-long message is still delivered.
        let room = (MAX_MESSAGE_LENGTH - 1) - self.used;
        let take = room.min(text.len());

        self.bytes[self.used..self.used + take].copy_from_slice(&text.as_bytes()[..take]);
        self.used += take;

        Ok(())
    }
}

struct Entry {
    timestamp_micros: u64,
    level: u8,
    group: u8,
    inclusion: u8,
    source_index: u32,
    function_index: u32,
    line: u32,
}

impl Entry {
    fn serialize(&self) -> [u8; ENTRY_HEADER_LENGTH] {
        let mut bytes = [0u8; ENTRY_HEADER_LENGTH];

        bytes[0..8].copy_from_slice(&self.timestamp_micros.to_ne_bytes());
        bytes[8] = self.level;
        bytes[9] = self.group;
        bytes[10] = self.inclusion;
        bytes[12..16].copy_from_slice(&self.source_index.to_ne_bytes());
        bytes[16..20].copy_from_slice(&self.function_index.to_ne_bytes());
        bytes[20..24].copy_from_slice(&self.line.to_ne_bytes());

        bytes
    }

    fn deserialize(bytes: &[u8]) -> Self {
        Self {
            timestamp_micros: u64::from_ne_bytes(bytes[0..8].try_into().unwrap_or_default()),
            level: bytes[8],
            group: bytes[9],
            inclusion: bytes[10],
            source_index: u32::from_ne_bytes(bytes[12..16].try_into().unwrap_or_default()),
            function_index: u32::from_ne_bytes(bytes[16..20].try_into().unwrap_or_default()),
            line: u32::from_ne_bytes(bytes[20..24].try_into().unwrap_or_default()),
        }
    }
}

fn timestamp_micros_now() -> u64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .map_or(0, |elapsed| elapsed.as_micros() as u64)
}

fn intern_function(common: &mut CommonState, state: &LogState, function: &'static str) -> u32 {
    let key = function.as_ptr() as usize;

    if let Some(&index) = common.function_indexes.get(&key) {
        return index;
    }

    let tables = state.tables.load_full();
    let mut updated = SourceTable::clone(&tables);

    updated.functions.push(function);

    let index = (updated.functions.len() - 1) as u32;

    state.tables.store(Arc::new(updated));
    common.function_indexes.insert(key, index);

    index
}

/// Stage a log message; the macros expand to this.
///
/// Performs the inclusion check, formats into a fixed stack buffer
/// (truncating over-long messages) and writes the entry into the FIFO.
/// Blocks only when the FIFO is full, never on the output device. Calls
/// made while the logger is not initialized are discarded.
#[doc(hidden)]
pub fn message(
    source: &'static LogSource,
    level: LogLevel,
    group: DebugGroups,
    line: u32,
    function: &'static str,
    arguments: fmt::Arguments<'_>,
) {
    let Some(state) = STATE.load_full() else {
        return;
    };

    let inclusion = included_in_state(&state, source, level, group, line);

    if inclusion.is_empty() {
        return;
    }

    // Timestamp before taking the staging mutex: more accurate timing when
    // the mutex is contended.
    let timestamp_micros = timestamp_micros_now();

    let mut buffer = MessageBuffer::new();
    let _ = buffer.write_fmt(arguments);

    let mut common = state.common.lock();

    attach_source(&state, &mut common, source);

    let entry = Entry {
        timestamp_micros,
        level: level as u8,
        group: group.bits(),
        inclusion: inclusion.bits(),
        source_index: source.index.load(Ordering::Acquire),
        function_index: intern_function(&mut common, &state, function),
        line,
    };

    // The two writes must stay contiguous in the FIFO, which is what the
    // staging mutex guarantees.
    if state.fifo.write(&entry.serialize()).is_err() {
        return;
    }

    if state.fifo.write(buffer.as_bytes_with_nul()).is_err() {
        return;
    }

    state.enqueued.fetch_add(1, Ordering::SeqCst);
}

/// Block until every entry staged so far has been written to the sink.
///
/// Intended for orderly shutdown points and tests; the logger itself never
/// needs it.
pub fn flush() {
    let Some(state) = STATE.load_full() else {
        return;
    };

    while state.emitted.load(Ordering::SeqCst) < state.enqueued.load(Ordering::SeqCst) {
        std::thread::sleep(std::time::Duration::from_millis(1));
    }
}

const COLOR_ERROR: &str = "\x1b[1;31m";
const COLOR_WARN: &str = "\x1b[1;34m";
const COLOR_INFO: &str = "\x1b[1m";
const COLOR_RESET: &str = "\x1b[m";

fn level_color(level: u8) -> Option<&'static str> {
    match LogLevel::from_u8(level) {
        Some(LogLevel::Error) => Some(COLOR_ERROR),
        Some(LogLevel::Warn) => Some(COLOR_WARN),
        Some(LogLevel::Info) => Some(COLOR_INFO),
        _ => None,
    }
}

fn format_line(entry: &Entry, tables: &SourceTable, message: &str) -> String {
    let timestamp = SystemTime::UNIX_EPOCH
        + std::time::Duration::from_micros(entry.timestamp_micros);
    let timestamp: DateTime<Local> = timestamp.into();

    let level_tag = LogLevel::from_u8(entry.level).map_or('U', LogLevel::tag);

    let source_name = tables
        .sources
        .get(entry.source_index as usize)
        .map_or("<unknown>", |source| source.name());

    let mut line = String::with_capacity(128 + message.len());

    let _ = write!(
        line,
        "{} <{}> <",
        timestamp.format("%Y-%m-%d %H:%M:%S%.6f"),
        level_tag
    );

    if entry.level == LogLevel::Debug as u8 {
        let group = DebugGroups::from_bits_truncate(entry.group);

        let _ = write!(line, "{}|", group.keyword());
    }

    if entry.line > 0 {
        let _ = write!(line, "{}:{}> ", source_name, entry.line);
    } else {
        let function = tables
            .functions
            .get(entry.function_index as usize)
            .copied()
            .unwrap_or("<unknown>");

        let _ = write!(line, "{}:{}> ", source_name, function);
    }

    line.push_str(message);
    line.push('\n');

    line
}

fn write_to_sink(output: &mut OutputState, line: &str, level: u8) {
    let Some(sink) = output.sink.as_mut() else {
        return;
    };

    let color = if output.color {
        level_color(level)
    } else {
        None
    };

    let mut payload = String::with_capacity(line.len() + 16);

    if let Some(color) = color {
        payload.push_str(color);
        // Color the prefix and the message but terminate the line after
        // the reset, so a sink that interleaves with other writers does
        // not leak color.
        payload.push_str(line.trim_end_matches('\n'));
        payload.push_str(COLOR_RESET);
        payload.push('\n');
    } else {
        payload.push_str(line);
    }

    // Sink failures are tolerated silently: reporting them through the
    // logger would feed back into this path.
    let bytes = payload.as_bytes();
    let mut offset = 0;

    while offset < bytes.len() {
        match sink.write(&bytes[offset..]) {
            Ok(0) => return,
            Ok(written) => offset += written,
            Err(_) => return,
        }
    }

    match sink.status() {
        Some(status) => output.written = status.size,
        None => output.written += bytes.len() as u64,
    }
}

fn maybe_rotate(output: &mut OutputState) {
    if output.rotate.is_none() {
        return;
    }

    if output.countdown > 0 {
        output.countdown -= 1;
    }

    if output.countdown != 0 || output.written <= MAX_OUTPUT_SIZE {
        return;
    }

    let Some(sink) = output.sink.take() else {
        return;
    };

    let Some(rotate) = output.rotate.as_mut() else {
        output.sink = Some(sink);

        return;
    };

    output.countdown = ROTATE_COUNTDOWN;

    match rotate(sink) {
        Ok((sink, info)) => {
            output.color = sink_supports_color(sink.as_ref());
            output.written = sink.status().map_or(0, |status| status.size);
            output.sink = Some(sink);

            if let Some(info) = info {
                let timestamp = SystemTime::now();
                let timestamp: DateTime<Local> = timestamp.into();

                let line = format!(
                    "{} <I> <{}:rotate> {}\n",
                    timestamp.format("%Y-%m-%d %H:%M:%S%.6f"),
                    _LOG_SOURCE.name(),
                    info
                );

                write_to_sink(output, &line, LogLevel::Info as u8);
            }
        }
        Err(_) => {
            // A failing rotate hook disables output until a new sink is
            // installed.
            output.sink = None;
        }
    }
}

fn forward_loop(state: &Arc<LogState>) {
    let mut buffer = vec![0u8; 2 * (ENTRY_HEADER_LENGTH + MAX_MESSAGE_LENGTH)];
    let mut used = 0;

    loop {
        let read = match state.fifo.read(&mut buffer[used..]) {
            Ok(0) => break,
            Ok(read) => read,
            Err(_) => break,
        };

        used += read;

        let mut offset = 0;

        while used - offset >= ENTRY_HEADER_LENGTH {
            let body = &buffer[offset + ENTRY_HEADER_LENGTH..used];

            let Some(terminator) = body.iter().position(|&byte| byte == 0) else {
                break;
            };

            let entry = Entry::deserialize(&buffer[offset..offset + ENTRY_HEADER_LENGTH]);
            let message = String::from_utf8_lossy(&body[..terminator]).into_owned();

            let tables = state.tables.load_full();
            let line = format_line(&entry, &tables, &message);

            {
                let mut output = state.output.lock();

                if entry.inclusion & Inclusion::PRIMARY.bits() != 0 {
                    write_to_sink(&mut output, &line, entry.level);
                }

                maybe_rotate(&mut output);
            }

            state.emitted.fetch_add(1, Ordering::SeqCst);

            offset += ENTRY_HEADER_LENGTH + terminator + 1;
        }

        buffer.copy_within(offset..used, 0);
        used -= offset;
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;

    /// Serializes tests that touch the process-wide logger.
    pub static LOGGER_TEST_GUARD: Mutex<()> = Mutex::new(());

    /// A sink that captures every line it receives.
    #[derive(Clone, Default)]
    pub struct CaptureSink {
        pub lines: Arc<Mutex<Vec<String>>>,
    }

    impl Io for CaptureSink {
        fn handle(&self) -> crate::io::IoHandle {
            -1
        }

        fn read(&mut self, _buffer: &mut [u8]) -> Result<usize> {
            Ok(0)
        }

        fn write(&mut self, buffer: &[u8]) -> Result<usize> {
            let text = String::from_utf8_lossy(buffer);

            let mut lines = self.lines.lock();

            for line in text.lines() {
                lines.push(line.to_string());
            }

            Ok(buffer.len())
        }
    }
}
