use bytes::{Bytes, BytesMut};

use crate::{MultipartError, MultipartResult, SizePolicy};

/// Position of a sealed part inside the final object
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PartSpec {
    /// 0-based; defines the order of the final object
    pub index: u32,
    pub offset: u64,
    pub size: u64,
}

/// Output of the chunker, consumed in order by the stager
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChunkEvent {
    /// Bytes that belong to part `index`, following any earlier bytes of it
    Data { index: u32, bytes: Bytes },
    /// Part is complete. No further data for it will follow
    Seal(PartSpec),
}

/// Part size for an object of known length.
///
/// Uses `preferred_part_size` while the part count stays within the limit,
/// otherwise the smallest size that fits the object into `max_part_count` parts.
pub fn optimal_part_size(policy: &SizePolicy, size: u64) -> MultipartResult<u64> {
    if size <= policy.preferred_part_size.saturating_mul(policy.max_part_count) {
        return Ok(policy.preferred_part_size);
    }

    let part_size = size.div_ceil(policy.max_part_count);
    if part_size > policy.max_part_size {
        return Err(MultipartError::size_limit(format!(
            "{} bytes need parts of {} bytes, above max_part_size {}",
            size, part_size, policy.max_part_size
        )));
    }
    Ok(part_size)
}

/// Part sizes for an object of known length, in index order
pub fn plan_parts(policy: &SizePolicy, size: u64) -> MultipartResult<Vec<u64>> {
    if size > policy.max_object_size {
        return Err(MultipartError::size_limit(format!(
            "object of {} bytes exceeds max_object_size {}",
            size, policy.max_object_size
        )));
    }
    if size == 0 {
        return Ok(Vec::new());
    }

    let part_size = optimal_part_size(policy, size)?;
    let count = size.div_ceil(part_size) as usize;
    let mut sizes = vec![part_size; count];
    let last = size - part_size * (count as u64 - 1);
    sizes[count - 1] = last;

    // Only the sole part may be smaller than the minimum.
    if count >= 2 && last < policy.min_part_size {
        let joined = part_size + last;
        if joined >= policy.min_part_size * 2 {
            sizes[count - 2] = joined - policy.min_part_size;
            sizes[count - 1] = policy.min_part_size;
        } else {
            sizes.pop();
            sizes[count - 2] = joined;
        }
    }
    Ok(sizes)
}

/// Part size for the part at `index` of a stream of unknown length.
///
/// Stays at `preferred_part_size` until the bytes left of `max_object_size`
/// would no longer fit into the remaining parts at `max_part_size` each, then
/// grows just enough to keep them fitting.
fn unknown_length_target(policy: &SizePolicy, index: u32, offset: u64) -> u64 {
    let later = policy.max_part_count.saturating_sub(index as u64 + 1);
    let needed = policy
        .max_object_size
        .saturating_sub(offset)
        .saturating_sub(policy.max_part_size.saturating_mul(later));
    needed.max(policy.preferred_part_size).min(policy.max_part_size)
}

/// Splits a byte stream into parts that respect a [`SizePolicy`].
///
/// With a declared length the layout is planned up front. Without one, the
/// last `min_part_size` bytes of the stream are held in memory, so that the
/// final part can either absorb them or take them as a part of its own. Any
/// stream up to `max_object_size` fits into `max_part_count` parts.
pub struct Chunker {
    policy: SizePolicy,
    declared: Option<u64>,
    plan: Vec<u64>,
    target: u64,
    index: u32,
    offset: u64,
    filled: u64,
    window: BytesMut,
    bytes_seen: u64,
    sealed: u32,
    finished: bool,
}

impl Chunker {
    /// Create a chunker. Fails before any part exists if a declared length
    /// cannot be stored under `policy`
    pub fn new(policy: SizePolicy, declared: Option<u64>) -> MultipartResult<Self> {
        policy.validate()?;
        let plan = match declared {
            Some(size) => plan_parts(&policy, size)?,
            None => Vec::new(),
        };
        let target = match declared {
            Some(_) => plan.first().copied().unwrap_or(0),
            None => unknown_length_target(&policy, 0, 0),
        };

        Ok(Self {
            policy,
            declared,
            plan,
            target,
            index: 0,
            offset: 0,
            filled: 0,
            window: BytesMut::new(),
            bytes_seen: 0,
            sealed: 0,
            finished: false,
        })
    }

    pub fn bytes_seen(&self) -> u64 {
        self.bytes_seen
    }

    pub fn parts_sealed(&self) -> u32 {
        self.sealed
    }

    /// Size the part currently being filled will have once full
    pub fn part_size(&self) -> u64 {
        self.target
    }

    pub fn declared_length(&self) -> Option<u64> {
        self.declared
    }

    /// Feed the next piece of the stream
    pub fn push(&mut self, mut bytes: Bytes) -> MultipartResult<Vec<ChunkEvent>> {
        if self.finished {
            return Err(MultipartError::invalid("write after the stream was finished"));
        }

        let seen = self.bytes_seen + bytes.len() as u64;
        if let Some(declared) = self.declared {
            if seen > declared {
                return Err(MultipartError::invalid(format!(
                    "received {} bytes, declared length is {}",
                    seen, declared
                )));
            }
        }
        if seen > self.policy.max_object_size {
            return Err(MultipartError::size_limit(format!(
                "stream of at least {} bytes exceeds max_object_size {}",
                seen, self.policy.max_object_size
            )));
        }
        self.bytes_seen = seen;

        let mut events = Vec::new();
        if self.declared.is_some() {
            while !bytes.is_empty() {
                self.fill_current(&mut bytes, &mut events);
                if self.filled == self.target {
                    self.seal_planned(&mut events);
                }
            }
            return Ok(events);
        }

        self.window.extend_from_slice(&bytes);
        let keep = self.policy.min_part_size as usize;
        while self.window.len() > keep {
            // The window still holds a full minimum part after this one.
            if self.filled == self.target {
                self.open_next(&mut events)?;
            }
            let room = (self.target - self.filled) as usize;
            let take = room.min(self.window.len() - keep);
            let chunk = self.window.split_to(take).freeze();
            self.filled += take as u64;
            events.push(ChunkEvent::Data {
                index: self.index,
                bytes: chunk,
            });
        }
        Ok(events)
    }

    /// End of stream: seal whatever is left as the final part
    pub fn finish(&mut self) -> MultipartResult<Vec<ChunkEvent>> {
        if self.finished {
            return Ok(Vec::new());
        }
        self.finished = true;

        if let Some(declared) = self.declared {
            if self.bytes_seen < declared {
                return Err(MultipartError::invalid(format!(
                    "stream ended after {} of {} declared bytes",
                    self.bytes_seen, declared
                )));
            }
            return Ok(Vec::new());
        }

        let mut events = Vec::new();
        let tail = self.window.split().freeze();
        if self.filled > 0 && self.filled + tail.len() as u64 > self.policy.max_part_size {
            // Too big to fold: the window is exactly one minimum part.
            self.open_next(&mut events)?;
        }

        let size = self.filled + tail.len() as u64;
        if size == 0 {
            return Ok(events);
        }
        if !tail.is_empty() {
            events.push(ChunkEvent::Data {
                index: self.index,
                bytes: tail,
            });
        }
        events.push(ChunkEvent::Seal(PartSpec {
            index: self.index,
            offset: self.offset,
            size,
        }));
        self.sealed += 1;
        Ok(events)
    }

    fn fill_current(&mut self, bytes: &mut Bytes, events: &mut Vec<ChunkEvent>) {
        let room = self.target - self.filled;
        let take = room.min(bytes.len() as u64) as usize;
        let chunk = bytes.split_to(take);
        self.filled += take as u64;
        events.push(ChunkEvent::Data {
            index: self.index,
            bytes: chunk,
        });
    }

    fn seal_current(&mut self, events: &mut Vec<ChunkEvent>) {
        events.push(ChunkEvent::Seal(PartSpec {
            index: self.index,
            offset: self.offset,
            size: self.filled,
        }));
        self.sealed += 1;
        self.offset += self.filled;
        self.index += 1;
        self.filled = 0;
    }

    fn seal_planned(&mut self, events: &mut Vec<ChunkEvent>) {
        self.seal_current(events);
        self.target = self.plan.get(self.index as usize).copied().unwrap_or(0);
    }

    fn open_next(&mut self, events: &mut Vec<ChunkEvent>) -> MultipartResult<()> {
        if self.index as u64 + 1 >= self.policy.max_part_count {
            return Err(MultipartError::size_limit(format!(
                "stream of at least {} bytes needs more than {} parts",
                self.bytes_seen, self.policy.max_part_count
            )));
        }
        self.seal_current(events);
        self.target = unknown_length_target(&self.policy, self.index, self.offset);
        Ok(())
    }
}
