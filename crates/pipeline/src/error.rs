use lcd_error::define_error;
use lcd_hal::AllocError;

define_error! {
    /// Pipeline errors. Only the fatal ones ever leave [`crate::Pipeline::new`];
    /// the rest are recovered and show up in counters and the log.
    pub enum PipelineError(0x21) {
        /// No draw buffer could be placed in any pool at any size.
        AllocationExhausted = 0x01 [fatal] => "Draw buffer allocation exhausted",
        /// The transfer engine stayed busy past the stall timeout.
        TransferStall = 0x02 => "Transfer stalled",
        /// The bus could not be acquired in time.
        AcquisitionTimeout = 0x03 => "Bus acquisition timed out",
        SizeOverflow = 0x04 => "Buffer size overflow",
        /// Zero-sized screen, or configuration and panel disagree.
        InvalidGeometry = 0x05 [fatal] => "Invalid display geometry",
        Alloc(AllocError) = 0x06 => "Allocation failed",
    }
}

impl From<AllocError> for PipelineError {
    fn from(e: AllocError) -> Self {
        match e {
            AllocError::SizeOverflow => PipelineError::SizeOverflow,
            other => PipelineError::Alloc(other),
        }
    }
}
