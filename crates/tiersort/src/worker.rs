//! Worker role: produce one value and send it to the aggregator.

use rand::Rng;
use tracing::{debug, info, warn};

use tiersort_core::{Error, Phase, Result, Role, Value, VALUE_BOUND};
use tiersort_transport::ChannelWriter;

/// Where a worker's value comes from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueSource {
    /// Uniform in `[0, VALUE_BOUND)`.
    Random,
    Fixed(Value),
}

impl ValueSource {
    pub fn generate(&self) -> Value {
        match self {
            ValueSource::Random => Value(rand::thread_rng().gen_range(0..VALUE_BOUND)),
            ValueSource::Fixed(value) => *value,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Worker {
    pub index: usize,
    pub source: ValueSource,
    /// Write only this many bytes of the frame, then close.
    pub short_write: Option<usize>,
}

impl Worker {
    pub fn new(index: usize, source: ValueSource) -> Self {
        Self {
            index,
            source,
            short_write: None,
        }
    }

    /// Generate a value, send it, and close the channel.
    pub async fn run(&self, writer: ChannelWriter) -> Result<Value> {
        let role = Role::Worker(self.index);
        let value = self.source.generate();
        if value.0 >= VALUE_BOUND {
            return Err(Error::InvalidConfig(format!(
                "value {value} is outside [0, {VALUE_BOUND})"
            ))
            .during(role, Phase::Generate));
        }
        debug!(worker = self.index, %value, "generated value");

        match self.short_write {
            Some(bytes) => {
                warn!(worker = self.index, bytes, "short write requested, sending a partial frame");
                let frame = value.to_le_bytes();
                writer
                    .write_all(&frame[..bytes.min(frame.len())])
                    .await
                    .map_err(Error::io("channel write"))
                    .map_err(|e| e.during(role, Phase::Send))?;
            }
            None => writer
                .write_value(value)
                .await
                .map_err(|e| e.during(role, Phase::Send))?,
        }
        writer.close();

        info!(worker = self.index, %value, "sent value");
        Ok(value)
    }
}
