mod capture;
mod parser;
mod record;
mod settings;
mod shutdown;
mod writer;

pub use capture::{CaptureWorker, ForwardOutcome, forward_record};
pub use parser::{DecodedFrame, NetworkInfo, TransportInfo, decode_frame};
pub use record::{Batch, PacketRecord, TcpFlagSet};
pub use settings::{BackpressurePolicy, Settings, StrictnessMode};
pub use shutdown::{Coordinator, ShutdownFlag};
pub use writer::{BatchSink, JsonFileSink, RotationPolicy, WriterStats, run_writer};
