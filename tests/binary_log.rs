//! End-to-end coverage of the binary log: a scripted session is fanned out
//! the way the event pump does it, written, replayed, and the replayed
//! sink calls are compared against the live ones.

use std::io::Cursor;

use retrace::binary_log::{BinaryLogPlayer, BinaryLogWriter, EventFilter, PlayerOptions};
use retrace::debug_context::{DebugContext, ThreadContextX64, ThreadContextX86};
use retrace::errors::PlayerError;
use retrace::event::{exception_name, ExceptionEvent, ProcessInfo, ProcessView, RipInfo};
use retrace::module_collection::ModuleCollection;
use retrace::rtti::ExceptionRtti;
use retrace::sink::EventSink;
use retrace::stack_trace::{DecodedInstruction, StackFrameEntry, StackTrace};

const K_DLL: &str = "C:\\k.dll";
const K_BASE: u64 = 0x7FF0_0000_0000;
const K_SIZE: u64 = 0x10000;
const START_TIME: i64 = 1_700_000_000;

fn process_view() -> ProcessView {
    ProcessView {
        process_id: 0x1234,
        thread_id: 0x5678,
        path: "C:\\app.exe".into(),
        working_directory: String::new(),
        arguments: Vec::new(),
    }
}

fn process_info() -> ProcessInfo {
    ProcessInfo {
        process_handle: 0x11,
        thread_handle: 0x22,
        process_id: 0x1234,
        thread_id: 0x5678,
    }
}

/// One scripted debug event, dispatched to sinks exactly the way the live
/// pump dispatches it.
enum Step {
    CreateProcess {
        time: i64,
        path: &'static str,
        base: u64,
        size: u64,
    },
    CreateThread {
        time: i64,
        entry_point: u64,
    },
    LoadDll {
        time: i64,
        path: &'static str,
        base: u64,
        size: u64,
    },
    UnloadDll {
        time: i64,
        base: u64,
    },
    ExitProcess {
        time: i64,
        exit_code: u32,
    },
    ExitThread {
        time: i64,
        exit_code: u32,
    },
    DebugAnsi {
        time: i64,
        message: &'static str,
    },
    DebugWide {
        time: i64,
        message: &'static str,
    },
    Rip {
        time: i64,
        kind: u32,
        error: u32,
    },
    Exception {
        time: i64,
        address: u64,
        code: u32,
        first_chance: bool,
        context: DebugContext,
        trace: StackTrace,
        rtti: Option<ExceptionRtti>,
    },
}

/// Fan a scripted session into one sink, maintaining the module index with
/// the pump's ordering rules (loads land before the fan-out, unloads
/// after).
fn drive(steps: &[Step], sink: &mut dyn EventSink) {
    let view = process_view();
    let pi = process_info();
    let mut modules = ModuleCollection::new();

    sink.on_initialization(START_TIME, &view);

    for step in steps {
        match step {
            Step::CreateProcess {
                time,
                path,
                base,
                size,
            } => {
                modules.load(path, *base, *size);
                sink.on_create_process(*time, *base, &pi, path, &modules);
            }
            Step::CreateThread { time, entry_point } => {
                sink.on_create_thread(*time, *entry_point, &pi, &modules);
            }
            Step::LoadDll {
                time,
                path,
                base,
                size,
            } => {
                modules.load(path, *base, *size);
                let index = modules.index_of_path(path);
                sink.on_dll_load(*time, *base, &pi, path, index, &modules);
            }
            Step::UnloadDll { time, base } => {
                let path = modules.path_at(*base).to_string();
                let index = modules.index_of_path(&path);
                sink.on_dll_unload(*time, *base, &pi, &path, index, &modules);
                modules.unload(*base);
            }
            Step::ExitProcess { time, exit_code } => {
                sink.on_exit_process(*time, *exit_code, &pi, &modules);
            }
            Step::ExitThread { time, exit_code } => {
                sink.on_exit_thread(*time, *exit_code, &pi, &modules);
            }
            Step::DebugAnsi { time, message } => {
                sink.on_debug_string(*time, &pi, message);
            }
            Step::DebugWide { time, message } => {
                sink.on_debug_string_wide(*time, &pi, message);
            }
            Step::Rip { time, kind, error } => {
                let info = RipInfo {
                    kind: *kind,
                    error: *error,
                };
                sink.on_rip(*time, &info, &pi, "");
            }
            Step::Exception {
                time,
                address,
                code,
                first_chance,
                context,
                trace,
                rtti,
            } => {
                // resolve frame owners against the live index, as capture
                // does at exception time
                let entries = trace
                    .entries()
                    .iter()
                    .map(|entry| StackFrameEntry {
                        module: modules.module_at_address(entry.address).cloned(),
                        ..entry.clone()
                    })
                    .collect();
                let trace = StackTrace::from_entries(
                    trace.max_recursion(),
                    trace.max_instructions(),
                    entries,
                );
                let event = ExceptionEvent {
                    address: *address,
                    code: *code,
                    first_chance: *first_chance,
                    wow64: !context.is_64(),
                    rtti: rtti.clone(),
                };
                if event.is_breakpoint() {
                    sink.on_breakpoint_hit(*time, &event, &pi, context, &trace, &modules);
                } else {
                    let name = exception_name(event.code).unwrap_or("");
                    sink.on_exception(*time, &event, &pi, name, context, &trace, &modules);
                }
            }
        }
    }

    sink.on_module_collection_complete(0, &modules);
}

fn write_log(steps: &[Step]) -> Vec<u8> {
    let mut writer = BinaryLogWriter::new(Cursor::new(Vec::new()));
    drive(steps, &mut writer);
    writer.into_inner().expect("no write errors").into_inner()
}

fn replay(
    bytes: Vec<u8>,
    options: PlayerOptions,
) -> Result<Vec<Recorded>, PlayerError> {
    let mut player = BinaryLogPlayer::new(Cursor::new(bytes), options)?;
    let mut recorder = Recorder::default();
    player.play(&mut [&mut recorder as &mut dyn EventSink])?;
    Ok(recorder.events)
}

/// Field-level capture of every sink call, for comparing a live fan-out
/// against its replay.
#[derive(Debug, Clone, PartialEq)]
struct Frame {
    module_path: Option<String>,
    address: u64,
    name: String,
    file: String,
    line: u32,
    recursion: bool,
    recursion_count: u64,
    instructions: Vec<DecodedInstruction>,
}

#[derive(Debug, Clone, PartialEq)]
enum Recorded {
    Init {
        time: i64,
        process_id: u32,
        thread_id: u32,
        path: String,
        working_directory: String,
        arguments: Vec<String>,
    },
    Breakpoint {
        time: i64,
        address: u64,
        code: u32,
        wow64: bool,
        program_counter: u64,
        frames: Vec<Frame>,
    },
    Exception {
        time: i64,
        address: u64,
        code: u32,
        name: String,
        first_chance: bool,
        wow64: bool,
        rtti: Option<ExceptionRtti>,
        frames: Vec<Frame>,
    },
    CreateProcess {
        time: i64,
        base: u64,
        path: String,
    },
    CreateThread {
        time: i64,
        entry_point: u64,
    },
    ExitProcess {
        time: i64,
        exit_code: u32,
    },
    ExitThread {
        time: i64,
        exit_code: u32,
    },
    DllLoad {
        time: i64,
        base: u64,
        path: String,
        index: i64,
    },
    DllUnload {
        time: i64,
        base: u64,
        path: String,
        index: i64,
    },
    DebugString {
        time: i64,
        wide: bool,
        message: String,
    },
    Rip {
        time: i64,
        kind: u32,
        error: u32,
    },
    Complete,
}

#[derive(Default)]
struct Recorder {
    events: Vec<Recorded>,
}

fn frames_of(trace: &StackTrace) -> Vec<Frame> {
    trace
        .entries()
        .iter()
        .map(|entry| Frame {
            module_path: entry.module.as_ref().map(|module| module.path.clone()),
            address: entry.address,
            name: entry.name.clone(),
            file: entry.file.clone(),
            line: entry.line,
            recursion: entry.recursion,
            recursion_count: entry.recursion_count,
            instructions: entry.instructions.clone(),
        })
        .collect()
}

impl EventSink for Recorder {
    fn on_initialization(&mut self, time: i64, process: &ProcessView) {
        self.events.push(Recorded::Init {
            time,
            process_id: process.process_id,
            thread_id: process.thread_id,
            path: process.path.clone(),
            working_directory: process.working_directory.clone(),
            arguments: process.arguments.clone(),
        });
    }

    fn on_breakpoint_hit(
        &mut self,
        time: i64,
        event: &ExceptionEvent,
        _pi: &ProcessInfo,
        context: &DebugContext,
        trace: &StackTrace,
        _modules: &ModuleCollection,
    ) {
        self.events.push(Recorded::Breakpoint {
            time,
            address: event.address,
            code: event.code,
            wow64: event.wow64,
            program_counter: context.program_counter(),
            frames: frames_of(trace),
        });
    }

    fn on_exception(
        &mut self,
        time: i64,
        event: &ExceptionEvent,
        _pi: &ProcessInfo,
        name: &str,
        _context: &DebugContext,
        trace: &StackTrace,
        _modules: &ModuleCollection,
    ) {
        self.events.push(Recorded::Exception {
            time,
            address: event.address,
            code: event.code,
            name: name.to_string(),
            first_chance: event.first_chance,
            wow64: event.wow64,
            rtti: event.rtti.clone(),
            frames: frames_of(trace),
        });
    }

    fn on_create_process(
        &mut self,
        time: i64,
        image_base: u64,
        _pi: &ProcessInfo,
        path: &str,
        _modules: &ModuleCollection,
    ) {
        self.events.push(Recorded::CreateProcess {
            time,
            base: image_base,
            path: path.to_string(),
        });
    }

    fn on_create_thread(
        &mut self,
        time: i64,
        entry_point: u64,
        _pi: &ProcessInfo,
        _modules: &ModuleCollection,
    ) {
        self.events.push(Recorded::CreateThread { time, entry_point });
    }

    fn on_exit_process(
        &mut self,
        time: i64,
        exit_code: u32,
        _pi: &ProcessInfo,
        _modules: &ModuleCollection,
    ) {
        self.events.push(Recorded::ExitProcess { time, exit_code });
    }

    fn on_exit_thread(
        &mut self,
        time: i64,
        exit_code: u32,
        _pi: &ProcessInfo,
        _modules: &ModuleCollection,
    ) {
        self.events.push(Recorded::ExitThread { time, exit_code });
    }

    fn on_dll_load(
        &mut self,
        time: i64,
        base: u64,
        _pi: &ProcessInfo,
        path: &str,
        module_index: i64,
        _modules: &ModuleCollection,
    ) {
        self.events.push(Recorded::DllLoad {
            time,
            base,
            path: path.to_string(),
            index: module_index,
        });
    }

    fn on_dll_unload(
        &mut self,
        time: i64,
        base: u64,
        _pi: &ProcessInfo,
        path: &str,
        module_index: i64,
        _modules: &ModuleCollection,
    ) {
        self.events.push(Recorded::DllUnload {
            time,
            base,
            path: path.to_string(),
            index: module_index,
        });
    }

    fn on_debug_string(&mut self, time: i64, _pi: &ProcessInfo, message: &str) {
        self.events.push(Recorded::DebugString {
            time,
            wide: false,
            message: message.to_string(),
        });
    }

    fn on_debug_string_wide(&mut self, time: i64, _pi: &ProcessInfo, message: &str) {
        self.events.push(Recorded::DebugString {
            time,
            wide: true,
            message: message.to_string(),
        });
    }

    fn on_rip(&mut self, time: i64, info: &RipInfo, _pi: &ProcessInfo, _error_message: &str) {
        self.events.push(Recorded::Rip {
            time,
            kind: info.kind,
            error: info.error,
        });
    }

    fn on_module_collection_complete(&mut self, _time: i64, _modules: &ModuleCollection) {
        self.events.push(Recorded::Complete);
    }
}

fn load_k_dll(time: i64) -> Step {
    Step::LoadDll {
        time,
        path: K_DLL,
        base: K_BASE,
        size: K_SIZE,
    }
}

fn x64_context(rip: u64) -> DebugContext {
    let registers = ThreadContextX64 {
        rip,
        rsp: 0x1000,
        rbp: 0x1010,
        ..Default::default()
    };
    DebugContext::from_x64(0x11, 0x22, registers)
}

fn breakpoint_step() -> Step {
    let trace = StackTrace::from_entries(
        0,
        0,
        vec![StackFrameEntry {
            address: 0x7FF0_0000_1234,
            name: "main".into(),
            file: "main.cpp".into(),
            line: 42,
            ..Default::default()
        }],
    );
    Step::Exception {
        time: START_TIME + 1,
        address: 0x7FF0_0000_1234,
        code: 0x8000_0003,
        first_chance: true,
        context: x64_context(0x7FF0_0000_1234),
        trace,
        rtti: None,
    }
}

fn msvc_throw_step() -> Step {
    let trace = StackTrace::from_entries(
        0,
        5,
        vec![StackFrameEntry {
            address: 0x7FF0_0000_2000,
            name: "thrower".into(),
            instructions: vec![DecodedInstruction {
                is_64bit: true,
                offset: 0x7FF0_0000_2000,
                size: 4,
                hex: "4883ec28".into(),
                mnemonic: "sub".into(),
                operands: "rsp, 0x28".into(),
            }],
            ..Default::default()
        }],
    );
    Step::Exception {
        time: START_TIME + 2,
        address: 0x7FF0_0000_2000,
        code: 0xE06D_7363,
        first_chance: true,
        context: x64_context(0x7FF0_0000_2000),
        trace,
        rtti: Some(ExceptionRtti {
            type_names: vec![
                "class std::runtime_error".into(),
                "class std::exception".into(),
            ],
            message: Some("bad thing".into()),
            throw_image_path: Some("C:\\app.exe".into()),
        }),
    }
}

// S1: a clean session replays init, the load, the exit and the completion,
// and the checksum holds.
#[test]
fn clean_exit_round_trip() {
    let steps = [load_k_dll(START_TIME), Step::ExitProcess {
        time: START_TIME + 1,
        exit_code: 0,
    }];
    let bytes = write_log(&steps);

    let events = replay(bytes, PlayerOptions::default()).unwrap();
    assert_eq!(
        events,
        vec![
            Recorded::Init {
                time: START_TIME,
                process_id: 0x1234,
                thread_id: 0x5678,
                path: "C:\\app.exe".into(),
                working_directory: String::new(),
                arguments: Vec::new(),
            },
            Recorded::DllLoad {
                time: START_TIME,
                base: K_BASE,
                path: K_DLL.into(),
                index: 0,
            },
            Recorded::ExitProcess {
                time: START_TIME + 1,
                exit_code: 0,
            },
            Recorded::Complete,
        ]
    );
}

// S2: a breakpoint-coded exception routes to the breakpoint handler with
// its context and single-frame trace intact.
#[test]
fn breakpoint_routes_to_breakpoint_handler() {
    let steps = [load_k_dll(START_TIME), breakpoint_step()];
    let events = replay(write_log(&steps), PlayerOptions::default()).unwrap();

    let Recorded::Breakpoint {
        address,
        code,
        wow64,
        program_counter,
        frames,
        ..
    } = &events[2]
    else {
        panic!("expected a breakpoint event, got {:?}", events[2]);
    };
    assert_eq!(*address, 0x7FF0_0000_1234);
    assert_eq!(*code, 0x8000_0003);
    assert!(!wow64);
    assert_eq!(*program_counter, 0x7FF0_0000_1234);
    assert_eq!(
        frames,
        &vec![Frame {
            module_path: Some(K_DLL.into()),
            address: 0x7FF0_0000_1234,
            name: "main".into(),
            file: "main.cpp".into(),
            line: 42,
            recursion: false,
            recursion_count: 0,
            instructions: Vec::new(),
        }]
    );
}

// S3: an MSVC throw replays as an exception with the RTTI summary filled.
#[test]
fn msvc_throw_replays_with_rtti() {
    let steps = [load_k_dll(START_TIME), msvc_throw_step()];
    let events = replay(write_log(&steps), PlayerOptions::default()).unwrap();

    let Recorded::Exception {
        code, name, rtti, frames, ..
    } = &events[2]
    else {
        panic!("expected an exception event, got {:?}", events[2]);
    };
    assert_eq!(*code, 0xE06D_7363);
    assert_eq!(name, "CXX_VCPP_EH_EXCEPTION");
    let rtti = rtti.as_ref().expect("RTTI must survive the round trip");
    assert_eq!(
        rtti.type_names,
        vec!["class std::runtime_error", "class std::exception"]
    );
    assert_eq!(rtti.message.as_deref(), Some("bad thing"));
    assert_eq!(rtti.throw_image_path.as_deref(), Some("C:\\app.exe"));
    assert_eq!(frames[0].instructions.len(), 1);
    assert_eq!(frames[0].instructions[0].mnemonic, "sub");
}

/// A canned walker for exercising the capture-side recursion collapse in
/// the same shapes the replay tests use.
struct CannedWalker(std::vec::IntoIter<retrace::symbols::RawFrame>);

impl CannedWalker {
    fn new(frames: &[(u64, u64)]) -> Self {
        CannedWalker(
            frames
                .iter()
                .map(|&(pc, ret)| retrace::symbols::RawFrame {
                    program_counter: pc,
                    return_address: ret,
                    ..Default::default()
                })
                .collect::<Vec<_>>()
                .into_iter(),
        )
    }
}

impl retrace::symbols::FrameWalker for CannedWalker {
    fn next_frame(&mut self) -> Option<retrace::symbols::RawFrame> {
        self.0.next()
    }
}

struct NoSymbols;

impl retrace::symbols::SymbolResolver for NoSymbols {
    fn symbol_at(&mut self, _: u64) -> Option<retrace::symbols::ResolvedSymbol> {
        None
    }
    fn line_at(&mut self, _: u64) -> Option<retrace::symbols::ResolvedLine> {
        None
    }
}

struct NoDecoder;

impl retrace::symbols::InstructionDecoder for NoDecoder {
    fn decode(&self, _: &[u8], _: u64, _: bool, _: usize) -> Vec<DecodedInstruction> {
        Vec::new()
    }
}

struct NoMemory;

impl retrace::memory::MemoryReader for NoMemory {
    fn read(&self, address: u64, buffer: &mut [u8]) -> Result<(), retrace::RemoteReadError> {
        Err(retrace::RemoteReadError {
            address,
            length: buffer.len(),
            os_error: 299,
        })
    }
}

fn capture_recursive_trace(recursive_frames: usize, max_recursion: u64) -> StackTrace {
    let mut frames = vec![(0x1000u64, 0x1000u64); recursive_frames];
    frames.push((0x5000, 0x2000));
    StackTrace::capture(
        &x64_context(0x1000),
        &ModuleCollection::new(),
        &NoMemory,
        &mut CannedWalker::new(&frames),
        &mut NoSymbols,
        &NoDecoder,
        max_recursion,
        0,
    )
}

// S4: fifteen directly recursive frames collapse at threshold 5 into one
// marker (plus the run's last frame), and survive a round trip; at
// threshold 20 all sixteen frames stay.
#[test]
fn recursion_collapse_round_trips() {
    let collapsed = capture_recursive_trace(15, 5);
    let steps = [Step::Exception {
        time: START_TIME,
        address: 0x1000,
        code: 0xC000_0005,
        first_chance: false,
        context: x64_context(0x1000),
        trace: collapsed,
        rtti: None,
    }];
    let events = replay(write_log(&steps), PlayerOptions::default()).unwrap();

    let Recorded::Exception { frames, .. } = &events[1] else {
        panic!("expected an exception event");
    };
    assert_eq!(frames.len(), 3);
    assert!(frames[0].recursion);
    assert_eq!(frames[0].recursion_count, 15);
    assert_eq!(frames[1].address, 0x1000);
    assert_eq!(frames[2].address, 0x5000);

    let uncollapsed = capture_recursive_trace(15, 20);
    assert_eq!(uncollapsed.len(), 16);
    assert!(uncollapsed.entries().iter().all(|entry| !entry.recursion));
}

// S5: one flipped path byte is caught by the sanity check; with the check
// disabled the log reads through and yields the altered path.
#[test]
fn tampered_path_is_rejected_unless_sanity_is_disabled() {
    let steps = [load_k_dll(START_TIME), Step::ExitProcess {
        time: START_TIME + 1,
        exit_code: 0,
    }];
    let mut bytes = write_log(&steps);

    // flip the last byte of the module path ("C:\k.dll" as UTF-16LE)
    let needle: Vec<u8> = K_DLL.encode_utf16().flat_map(u16::to_le_bytes).collect();
    let at = bytes
        .windows(needle.len())
        .rposition(|window| window == needle)
        .expect("path bytes present");
    bytes[at + needle.len() - 2] ^= 0x01;

    let strict = replay(bytes.clone(), PlayerOptions::default());
    assert!(matches!(strict, Err(PlayerError::ChecksumMismatch { .. })));

    let lax = replay(
        bytes,
        PlayerOptions {
            skip_sanity_check: true,
            ..Default::default()
        },
    )
    .unwrap();
    let Recorded::DllLoad { path, .. } = &lax[1] else {
        panic!("expected the load event");
    };
    assert_ne!(path, K_DLL);
    assert_eq!(lax.last(), Some(&Recorded::Complete));
}

// S6: an allowlist of load_dll delivers only the load; the module index
// still tracks it (the delivered index is the first-seen one).
#[test]
fn filter_delivers_only_allowed_events() {
    let steps = [load_k_dll(START_TIME), breakpoint_step()];
    let options = PlayerOptions {
        filter: Some(EventFilter::from_names(["load_dll"]).unwrap()),
        ..Default::default()
    };
    let events = replay(write_log(&steps), options).unwrap();

    assert_eq!(events.len(), 3);
    assert!(matches!(events[0], Recorded::Init { .. }));
    assert!(matches!(
        events[1],
        Recorded::DllLoad { base: K_BASE, index: 0, .. }
    ));
    assert_eq!(events[2], Recorded::Complete);
}

// The module index keeps feeding address resolution even when the load
// event itself is filtered away.
#[test]
fn filtered_load_still_resolves_trace_addresses() {
    let steps = [load_k_dll(START_TIME), breakpoint_step()];
    let options = PlayerOptions {
        filter: Some(EventFilter::from_names(["breakpoint"]).unwrap()),
        ..Default::default()
    };
    let events = replay(write_log(&steps), options).unwrap();

    let Recorded::Breakpoint { frames, .. } = &events[1] else {
        panic!("expected the breakpoint event");
    };
    assert_eq!(frames[0].module_path.as_deref(), Some(K_DLL));
}

// Property 4: the replayed sink-call sequence equals the live one, field
// for field.
#[test]
fn replay_matches_live_fanout() {
    let steps = [
        Step::CreateProcess {
            time: START_TIME,
            path: "C:\\app.exe",
            base: 0x1_4000_0000,
            size: 0x8000,
        },
        Step::CreateThread {
            time: START_TIME,
            entry_point: 0x1_4000_1000,
        },
        load_k_dll(START_TIME),
        Step::DebugAnsi {
            time: START_TIME + 1,
            message: "checkpoint reached",
        },
        Step::DebugWide {
            time: START_TIME + 1,
            message: "wide checkpoint",
        },
        breakpoint_step(),
        msvc_throw_step(),
        Step::Rip {
            time: START_TIME + 3,
            kind: 1,
            error: 5,
        },
        Step::UnloadDll {
            time: START_TIME + 4,
            base: K_BASE,
        },
        Step::ExitThread {
            time: START_TIME + 5,
            exit_code: 0,
        },
        Step::ExitProcess {
            time: START_TIME + 5,
            exit_code: 7,
        },
    ];

    let mut live = Recorder::default();
    drive(&steps, &mut live);

    let replayed = replay(write_log(&steps), PlayerOptions::default()).unwrap();
    assert_eq!(replayed, live.events);
}

// Replaying a log through a second writer reproduces the file bit for bit.
#[test]
fn replay_through_writer_is_bit_identical() {
    let steps = [
        Step::CreateProcess {
            time: START_TIME,
            path: "C:\\app.exe",
            base: 0x1_4000_0000,
            size: 0x8000,
        },
        load_k_dll(START_TIME),
        breakpoint_step(),
        msvc_throw_step(),
        Step::DebugWide {
            time: START_TIME + 2,
            message: "wide checkpoint",
        },
        Step::UnloadDll {
            time: START_TIME + 3,
            base: K_BASE,
        },
        Step::ExitProcess {
            time: START_TIME + 5,
            exit_code: 0,
        },
    ];
    let original = write_log(&steps);

    let mut player =
        BinaryLogPlayer::new(Cursor::new(original.clone()), PlayerOptions::default()).unwrap();
    let mut rewriter = BinaryLogWriter::new(Cursor::new(Vec::new()));
    player.play(&mut [&mut rewriter as &mut dyn EventSink]).unwrap();
    let rewritten = rewriter.into_inner().unwrap().into_inner();

    assert_eq!(rewritten, original);
}

// Property 6: a Wow64 exception carries the 32-bit register file and the
// flag round-trips with it.
#[test]
fn wow64_flag_matches_context_width() {
    let registers = ThreadContextX86 {
        eip: 0x0040_1000,
        esp: 0x0012_0000,
        ..Default::default()
    };
    let steps = [Step::Exception {
        time: START_TIME,
        address: 0x0040_1000,
        code: 0xC000_0005,
        first_chance: true,
        context: DebugContext::from_x86(0x11, 0x22, registers),
        trace: StackTrace::from_entries(0, 0, Vec::new()),
        rtti: None,
    }];
    let events = replay(write_log(&steps), PlayerOptions::default()).unwrap();

    let Recorded::Exception { wow64, name, .. } = &events[1] else {
        panic!("expected an exception event");
    };
    assert!(*wow64);
    assert_eq!(name, "EXCEPTION_ACCESS_VIOLATION");
}

// Boundary: a zero-length debug string is emitted and round-trips.
#[test]
fn empty_debug_string_round_trips() {
    let steps = [Step::DebugAnsi {
        time: START_TIME,
        message: "",
    }];
    let events = replay(write_log(&steps), PlayerOptions::default()).unwrap();
    assert_eq!(
        events[1],
        Recorded::DebugString {
            time: START_TIME,
            wide: false,
            message: String::new(),
        }
    );
}

#[test]
fn truncated_log_reports_premature_eof() {
    let steps = [load_k_dll(START_TIME)];
    let mut bytes = write_log(&steps);
    bytes.truncate(bytes.len() - 5);

    let result = replay(
        bytes,
        PlayerOptions {
            skip_sanity_check: true,
            ..Default::default()
        },
    );
    assert!(matches!(result, Err(PlayerError::UnexpectedEof)));
}

#[test]
fn corrupt_event_signature_is_rejected() {
    let steps = [Step::ExitProcess {
        time: START_TIME,
        exit_code: 0,
    }];
    let mut bytes = write_log(&steps);

    // the first frame starts right after the header trailer
    let at = bytes
        .windows(4)
        .position(|window| window == b"EVNT")
        .unwrap();
    bytes[at] = b'X';

    let result = replay(
        bytes,
        PlayerOptions {
            skip_sanity_check: true,
            ..Default::default()
        },
    );
    assert!(matches!(
        result,
        Err(PlayerError::UnexpectedSignature { expected, .. }) if &expected == b"EVNT"
    ));
}

#[test]
fn unknown_event_id_is_rejected() {
    let steps = [Step::ExitProcess {
        time: START_TIME,
        exit_code: 0,
    }];
    let mut bytes = write_log(&steps);

    let at = bytes
        .windows(4)
        .position(|window| window == b"EVNT")
        .unwrap();
    // event_id sits after the signature and the 8-byte timestamp
    bytes[at + 12] = 99;

    let result = replay(
        bytes,
        PlayerOptions {
            skip_sanity_check: true,
            ..Default::default()
        },
    );
    assert!(matches!(result, Err(PlayerError::UnknownEventId(99))));
}

#[test]
fn version_mismatch_is_rejected() {
    let steps = [Step::ExitProcess {
        time: START_TIME,
        exit_code: 0,
    }];
    let mut bytes = write_log(&steps);
    // bump the major version in the header word
    bytes[7] = bytes[7].wrapping_add(1);

    let result = replay(bytes, PlayerOptions::default());
    assert!(matches!(result, Err(PlayerError::UnsupportedVersion { .. })));
}

#[test]
fn damaged_header_crc_means_unfinalized_file() {
    // a writer that never saw the completion event leaves crc32 == 0
    let mut writer = BinaryLogWriter::new(Cursor::new(Vec::new()));
    let view = process_view();
    writer.on_initialization(START_TIME, &view);
    let bytes = writer.into_inner().unwrap().into_inner();

    let result = replay(bytes.clone(), PlayerOptions::default());
    assert!(matches!(result, Err(PlayerError::ChecksumMismatch { .. })));

    // with the check disabled it reads through
    let events = replay(
        bytes,
        PlayerOptions {
            skip_sanity_check: true,
            ..Default::default()
        },
    )
    .unwrap();
    assert!(matches!(events[0], Recorded::Init { .. }));
}

#[test]
fn invalid_filter_names_are_rejected() {
    let error = EventFilter::from_names(["load_dll", "teapot"]).unwrap_err();
    assert!(matches!(error, PlayerError::InvalidFilterEvent(name) if name == "teapot"));
}

#[test]
fn file_backed_log_round_trips() {
    let directory = tempfile::tempdir().unwrap();
    let path = directory.path().join("session.hind");

    let steps = [load_k_dll(START_TIME), Step::ExitProcess {
        time: START_TIME + 1,
        exit_code: 0,
    }];
    let mut writer = BinaryLogWriter::create(&path).unwrap();
    drive(&steps, &mut writer);
    writer.into_inner().unwrap();

    let mut player = BinaryLogPlayer::open(&path, PlayerOptions::default()).unwrap();
    let mut recorder = Recorder::default();
    player.play(&mut [&mut recorder as &mut dyn EventSink]).unwrap();
    assert_eq!(recorder.events.len(), 4);
    assert_eq!(recorder.events.last(), Some(&Recorded::Complete));
}
