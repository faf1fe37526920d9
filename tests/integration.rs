//! Cross-component scenarios: configuration into the logger, signal-driven
//! shutdown, writer backpressure against a live event loop, and log
//! rotation onto real files.

use std::cell::RefCell;
use std::io::Write as _;
use std::rc::Rc;
use std::sync::Arc;
use std::time::{Duration, Instant};

use daemonlib::event::callback;
use daemonlib::log_source;
use daemonlib::packet::PacketHeader;
use daemonlib::{
    ConfFile, Error, EventLoop, Events, Io, IoHandle, Packet, Pipe, PipeFlags, SignalBridge,
    SourceType, Writer,
};
use parking_lot::Mutex;

log_source!();

/// The logger is process-wide; tests that initialize it are serialized.
static LOGGER_GUARD: Mutex<()> = Mutex::new(());

/// A sink that captures whole lines for assertions.
#[derive(Clone, Default)]
struct CaptureSink {
    lines: Arc<Mutex<Vec<String>>>,
}

impl Io for CaptureSink {
    fn handle(&self) -> IoHandle {
        -1
    }

    fn read(&mut self, _buffer: &mut [u8]) -> daemonlib::Result<usize> {
        Ok(0)
    }

    fn write(&mut self, buffer: &[u8]) -> daemonlib::Result<usize> {
        let text = String::from_utf8_lossy(buffer);
        let mut lines = self.lines.lock();

        for line in text.lines() {
            lines.push(line.to_string());
        }

        Ok(buffer.len())
    }
}

#[test]
fn test_config_round_trip_into_logger() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("daemon.conf");

    let mut file = std::fs::File::create(&path).unwrap();
    file.write_all(b"# hi\nlog.level = debug\n log.level\t=\twarn\n")
        .unwrap();

    let conf = ConfFile::read(&path, None).unwrap();
    assert_eq!(conf.get("log.level"), Some("warn"));

    let config = daemonlib::log::Config::from_conf_file(&conf);
    assert_eq!(config.level, daemonlib::LogLevel::Warn);

    let _guard = LOGGER_GUARD.lock();

    daemonlib::log::init(&config).unwrap();
    assert_eq!(daemonlib::log::effective_level(), daemonlib::LogLevel::Warn);
    daemonlib::log::exit();
}

#[test]
fn test_debug_filter_precedence_from_config() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("daemon.conf");

    let mut file = std::fs::File::create(&path).unwrap();
    file.write_all(b"log.level = debug\nlog.debug_filter = +all,-packet,+packet:137\n")
        .unwrap();

    let conf = ConfFile::read(&path, None).unwrap();
    let config = daemonlib::log::Config::from_conf_file(&conf);

    let _guard = LOGGER_GUARD.lock();

    daemonlib::log::init(&config).unwrap();

    static SOURCE_FOO: daemonlib::LogSource = daemonlib::LogSource::new("src/foo.c");

    let included = |group, line| {
        !daemonlib::log::is_included(&SOURCE_FOO, daemonlib::LogLevel::Debug, group, line)
            .is_empty()
    };

    assert!(included(daemonlib::DebugGroups::PACKET, 137));
    assert!(!included(daemonlib::DebugGroups::PACKET, 138));
    assert!(included(daemonlib::DebugGroups::EVENT, 138));

    daemonlib::log::exit();
}

#[test]
fn test_sigterm_stops_event_loop_promptly() {
    let _guard = LOGGER_GUARD.lock();

    let mut event_loop = EventLoop::new().unwrap();
    let signals = SignalBridge::new(&mut event_loop, None).unwrap();

    // Deliver SIGTERM while the loop is blocked in its wait, so the
    // measurement covers the handler, the pipe wake-up and the dispatch.
    let raised_at = Arc::new(Mutex::new(None::<Instant>));
    let raised_at_raiser = Arc::clone(&raised_at);

    let raiser = daemonlib::sync::Thread::spawn("sigterm-raiser", move || {
        std::thread::sleep(Duration::from_millis(50));

        *raised_at_raiser.lock() = Some(Instant::now());
        signal_hook::low_level::raise(libc::SIGTERM).unwrap();
    });

    event_loop.run(|_| {}).unwrap();

    let elapsed = raised_at
        .lock()
        .as_ref()
        .expect("SIGTERM was never raised")
        .elapsed();

    raiser.join();

    assert!(!event_loop.is_running());
    assert!(
        elapsed < Duration::from_millis(100),
        "loop took {elapsed:?} to stop after SIGTERM"
    );

    signals.exit(&mut event_loop);
}

/// An `Io` stub that refuses every write with would-block, backed by a real
/// handle so the event loop can register it.
struct CongestedIo {
    handle: IoHandle,
}

impl Io for CongestedIo {
    fn handle(&self) -> IoHandle {
        self.handle
    }

    fn read(&mut self, _buffer: &mut [u8]) -> daemonlib::Result<usize> {
        Ok(0)
    }

    fn write(&mut self, _buffer: &[u8]) -> daemonlib::Result<usize> {
        Err(Error::would_block("stubbed congestion"))
    }
}

#[test]
fn test_writer_backpressure_drop_accounting() {
    let _guard = LOGGER_GUARD.lock();

    let sink = CaptureSink::default();
    let lines = Arc::clone(&sink.lines);

    daemonlib::log::init(&daemonlib::log::Config::default()).unwrap();
    daemonlib::log::set_output(Box::new(sink));

    let mut event_loop = EventLoop::new().unwrap();
    let pipe = Pipe::new(PipeFlags::empty()).unwrap();
    let handle = pipe.write_handle();

    event_loop
        .add_source(handle, SourceType::Generic, Events::empty(), None, None)
        .unwrap();

    let mut writer = Writer::new(
        Box::new(CongestedIo { handle }),
        "response",
        Packet::signature,
        Box::new(|| "stub client".to_string()),
        Box::new(|| panic!("disconnect must not fire on would-block")),
    );

    let header = PacketHeader {
        uid: 42,
        length: 0,
        function_id: 1,
        sequence_number_and_options: 1 << 4,
        error_code_and_future_use: 0,
    };
    let packet = Packet::new(header, &[0u8; 16]).unwrap();

    let total = daemonlib::writer::MAX_BACKLOG + 2;

    for _ in 0..total {
        writer.write(&mut event_loop, &packet).unwrap();
    }

    assert_eq!(writer.backlog_length(), daemonlib::writer::MAX_BACKLOG);
    assert_eq!(writer.dropped_count(), 2);
    assert_eq!(
        event_loop.requested_events(handle, SourceType::Generic),
        Some(Events::WRITE)
    );

    daemonlib::log::flush();

    let warnings = lines
        .lock()
        .iter()
        .filter(|line| line.contains("Write backlog") && line.contains("<W>"))
        .count();

    assert_eq!(warnings, 1);

    writer.destroy(&mut event_loop);
    daemonlib::log::exit();
}

#[test]
fn test_rotation_swaps_log_files() {
    let _guard = LOGGER_GUARD.lock();

    let dir = tempfile::tempdir().unwrap();
    let first_path = dir.path().join("daemon.log");
    let second_path = dir.path().join("daemon.log.1");

    daemonlib::log::init(&daemonlib::log::Config::default()).unwrap();
    daemonlib::log::set_output(Box::new(daemonlib::io::File::create(&first_path).unwrap()));

    let rotations = Arc::new(Mutex::new(0u32));
    let rotations_hook = Arc::clone(&rotations);
    let second_path_hook = second_path.clone();

    daemonlib::log::set_rotate(Some(Box::new(move |old_sink| {
        *rotations_hook.lock() += 1;

        drop(old_sink);

        let sink = daemonlib::io::File::create(&second_path_hook)?;

        Ok((
            Box::new(sink) as Box<dyn Io + Send>,
            Some("output rotated".to_string()),
        ))
    })));

    // Push the first file beyond the 5 MiB threshold.
    let payload = "y".repeat(900);
    let mut emitted = 0usize;

    while emitted < 6 * 1024 * 1024 {
        daemonlib::log_info!("{}", payload);
        emitted += payload.len();
    }

    daemonlib::log::flush();

    assert_eq!(*rotations.lock(), 1);

    let second = std::fs::read_to_string(&second_path).unwrap();
    assert!(second.contains("output rotated"));

    // Lines after the swap land in the new file.
    daemonlib::log_info!("after rotation marker");
    daemonlib::log::flush();

    let second = std::fs::read_to_string(&second_path).unwrap();
    assert!(second.contains("after rotation marker"));

    let first_size = std::fs::metadata(&first_path).unwrap().len();
    assert!(first_size > 5 * 1024 * 1024);

    daemonlib::log::exit();
}

#[test]
fn test_fifo_wrap_around_delivery() {
    let fifo = daemonlib::Fifo::new(8);
    let mut scratch = [0u8; 8];

    assert_eq!(fifo.try_write(&[1, 2, 3, 4, 5]).unwrap(), 5);
    assert_eq!(fifo.try_read(&mut scratch).unwrap(), 5);

    // Capacity is 7, free space is 7, but the copy straddles the wrap
    // point and must be split into two regions.
    let payload = [6, 7, 8, 9, 10, 11];
    assert_eq!(fifo.try_write(&payload).unwrap(), 6);

    let n = fifo.try_read(&mut scratch).unwrap();
    assert_eq!(&scratch[..n], &payload);
}

#[test]
fn test_timer_drives_periodic_work_until_stopped() {
    let _guard = LOGGER_GUARD.lock();

    let mut event_loop = EventLoop::new().unwrap();
    let ticks = Rc::new(RefCell::new(0u32));
    let ticks_cb = Rc::clone(&ticks);
    let stop_handle = event_loop.stop_handle();

    let timer = daemonlib::Timer::new(
        &mut event_loop,
        Box::new(move || {
            let mut ticks = ticks_cb.borrow_mut();
            *ticks += 1;

            if *ticks == 5 {
                stop_handle.stop();
            }
        }),
    )
    .unwrap();

    timer
        .configure(Duration::from_millis(2), Duration::from_millis(2))
        .unwrap();

    event_loop.run(|_| {}).unwrap();

    assert!(*ticks.borrow() >= 5);
    timer.destroy(&mut event_loop);
}

#[test]
fn test_loop_cleanup_callback_runs_between_iterations() {
    let _guard = LOGGER_GUARD.lock();

    let mut event_loop = EventLoop::new().unwrap();
    let pipe = Pipe::new(PipeFlags::empty()).unwrap();

    pipe.write(b"x").unwrap();

    let reader = Rc::new(pipe);
    let reader_cb = Rc::clone(&reader);

    event_loop
        .add_source(
            reader.read_handle(),
            SourceType::Generic,
            Events::READ,
            Some(callback(move |event_loop| {
                let mut scratch = [0u8; 4];
                reader_cb.read(&mut scratch).unwrap();
                event_loop.stop();
            })),
            None,
        )
        .unwrap();

    let mut cleanups = 0;

    event_loop
        .run(|_event_loop| {
            cleanups += 1;
        })
        .unwrap();

    // Once before the first wait and once after the dispatch that stopped
    // the loop.
    assert!(cleanups >= 2);
}
