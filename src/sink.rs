//! The event-sink interface every consumer of the crash snapshot stream
//! implements: the textual formatter, the binary log writer, or anything
//! else bolted onto a session.

use crate::debug_context::DebugContext;
use crate::event::{ExceptionEvent, ProcessInfo, ProcessView, RipInfo};
use crate::module_collection::ModuleCollection;
use crate::stack_trace::StackTrace;

/// Receives every normalized debug event, in the order the pump observed
/// them. All methods default to no-ops so sinks only handle what they care
/// about. Implementations must be total: a sink that fails internally on
/// one event still receives the next.
///
/// For `on_dll_unload` the module is still present in `modules`; it is
/// removed from the index only after every sink has seen the event.
#[allow(unused_variables)]
pub trait EventSink {
    fn on_initialization(&mut self, time: i64, process: &ProcessView) {}

    fn on_breakpoint_hit(
        &mut self,
        time: i64,
        event: &ExceptionEvent,
        pi: &ProcessInfo,
        context: &DebugContext,
        trace: &StackTrace,
        modules: &ModuleCollection,
    ) {
    }

    fn on_exception(
        &mut self,
        time: i64,
        event: &ExceptionEvent,
        pi: &ProcessInfo,
        name: &str,
        context: &DebugContext,
        trace: &StackTrace,
        modules: &ModuleCollection,
    ) {
    }

    fn on_create_process(
        &mut self,
        time: i64,
        image_base: u64,
        pi: &ProcessInfo,
        path: &str,
        modules: &ModuleCollection,
    ) {
    }

    fn on_create_thread(
        &mut self,
        time: i64,
        entry_point: u64,
        pi: &ProcessInfo,
        modules: &ModuleCollection,
    ) {
    }

    fn on_exit_process(
        &mut self,
        time: i64,
        exit_code: u32,
        pi: &ProcessInfo,
        modules: &ModuleCollection,
    ) {
    }

    fn on_exit_thread(
        &mut self,
        time: i64,
        exit_code: u32,
        pi: &ProcessInfo,
        modules: &ModuleCollection,
    ) {
    }

    fn on_dll_load(
        &mut self,
        time: i64,
        base: u64,
        pi: &ProcessInfo,
        path: &str,
        module_index: i64,
        modules: &ModuleCollection,
    ) {
    }

    fn on_debug_string(&mut self, time: i64, pi: &ProcessInfo, message: &str) {}

    fn on_debug_string_wide(&mut self, time: i64, pi: &ProcessInfo, message: &str) {}

    fn on_rip(&mut self, time: i64, info: &RipInfo, pi: &ProcessInfo, error_message: &str) {}

    fn on_dll_unload(
        &mut self,
        time: i64,
        base: u64,
        pi: &ProcessInfo,
        path: &str,
        module_index: i64,
        modules: &ModuleCollection,
    ) {
    }

    /// The session is over and the module index is in its final state.
    /// Sinks finalize their output here.
    fn on_module_collection_complete(&mut self, time: i64, modules: &ModuleCollection) {}
}
