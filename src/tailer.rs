//! Read-side accessor of the log.
//!
//! A tailer keeps a (cycle, sequence) position and a cached store handle.
//! Reads never block on writers: a forward tailer at the published tail
//! sees `None` until the next commit word becomes visible, then resumes.

use std::sync::Arc;

use crate::directory::{CreateMode, Direction, SegmentDirectory};
use crate::store::SegmentStore;
use crate::Result;

/// One record read out of the log, with its packed index.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Excerpt {
    pub index: u64,
    pub timestamp_millis: u64,
    pub payload: Vec<u8>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Position {
    /// Not yet placed; the first read resolves the starting segment.
    Unpositioned,
    At { cycle: u32, sequence: u64 },
    /// A backward tailer has walked past the first record.
    Exhausted,
}

pub struct Tailer {
    directory: Arc<SegmentDirectory>,
    direction: Direction,
    position: Position,
    current: Option<(u32, Arc<SegmentStore>)>,
}

impl Tailer {
    pub fn new(directory: Arc<SegmentDirectory>, direction: Direction) -> Self {
        Self {
            directory,
            direction,
            position: Position::Unpositioned,
            current: None,
        }
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    /// Moves to the first record of the earliest existing segment.
    pub fn to_start(&mut self) -> Result<()> {
        self.position = match self.directory.first_cycle()? {
            Some(cycle) => Position::At { cycle, sequence: 0 },
            None => Position::Unpositioned,
        };
        Ok(())
    }

    /// Moves past the last published record of the latest segment. A
    /// forward tailer then reads nothing until more records are appended;
    /// a backward tailer reads the log tail first.
    pub fn to_end(&mut self) -> Result<()> {
        self.position = match self.directory.last_cycle()? {
            Some(cycle) => {
                let store = self.store_for(cycle)?;
                let count = store.as_ref().map_or(0, |s| s.record_count());
                match self.direction {
                    Direction::Forward => Position::At {
                        cycle,
                        sequence: count,
                    },
                    Direction::Backward if count > 0 => Position::At {
                        cycle,
                        sequence: count - 1,
                    },
                    Direction::Backward => Position::At { cycle, sequence: 0 },
                }
            }
            None => Position::Unpositioned,
        };
        Ok(())
    }

    /// Positions on `index` if its record exists; `false` leaves the
    /// position unchanged.
    pub fn move_to_index(&mut self, index: u64) -> Result<bool> {
        let roll = *self.directory.roll_cycle();
        let cycle = roll.to_cycle(index);
        let sequence = roll.to_sequence(index);
        let present = match self.store_for(cycle)? {
            Some(store) => store.read(sequence)?.is_some(),
            None => false,
        };
        if present {
            self.position = Position::At { cycle, sequence };
        }
        Ok(present)
    }

    /// The index the next `read_next` would return, if positioned.
    pub fn index(&self) -> Option<u64> {
        match self.position {
            Position::At { cycle, sequence } => {
                Some(self.directory.roll_cycle().to_index(cycle, sequence))
            }
            _ => None,
        }
    }

    /// Reads the record at the current position and advances along the
    /// tailer's direction, hopping segments via the directory scan.
    /// `None` means no record is available yet (forward) or the log start
    /// has been passed (backward).
    pub fn read_next(&mut self) -> Result<Option<Excerpt>> {
        if matches!(self.position, Position::Unpositioned) {
            match self.direction {
                Direction::Forward => self.to_start()?,
                Direction::Backward => self.to_end()?,
            }
        }
        loop {
            let (cycle, sequence) = match self.position {
                Position::At { cycle, sequence } => (cycle, sequence),
                _ => return Ok(None),
            };
            let store = match self.store_for(cycle)? {
                Some(store) => store,
                None => return Ok(None),
            };

            if let Some(view) = store.read(sequence)? {
                let excerpt = Excerpt {
                    index: self.directory.roll_cycle().to_index(cycle, view.sequence),
                    timestamp_millis: view.timestamp_millis,
                    payload: view.payload.to_vec(),
                };
                self.advance(cycle, sequence)?;
                return Ok(Some(excerpt));
            }

            match self.direction {
                Direction::Forward => {
                    // Hop only once a later segment exists; until then the
                    // current segment is still the live tail.
                    if sequence < store.record_count() {
                        return Ok(None);
                    }
                    match self.directory.next_cycle(cycle, Direction::Forward)? {
                        Some(next) => {
                            self.position = Position::At {
                                cycle: next,
                                sequence: 0,
                            };
                        }
                        None => return Ok(None),
                    }
                }
                Direction::Backward => {
                    // Empty or shorter-than-expected segment; step to the
                    // previous one.
                    if !self.step_back_cycle(cycle)? {
                        return Ok(None);
                    }
                }
            }
        }
    }

    fn advance(&mut self, cycle: u32, sequence: u64) -> Result<()> {
        match self.direction {
            Direction::Forward => {
                self.position = Position::At {
                    cycle,
                    sequence: sequence + 1,
                };
            }
            Direction::Backward => {
                if sequence > 0 {
                    self.position = Position::At {
                        cycle,
                        sequence: sequence - 1,
                    };
                } else {
                    self.step_back_cycle(cycle)?;
                }
            }
        }
        Ok(())
    }

    /// Moves to the tail of the nearest earlier segment. Returns `false`
    /// when none exists; the tailer is then exhausted.
    fn step_back_cycle(&mut self, cycle: u32) -> Result<bool> {
        match self.directory.next_cycle(cycle, Direction::Backward)? {
            Some(previous) => {
                let count = self
                    .store_for(previous)?
                    .map_or(0, |s| s.record_count());
                if count == 0 {
                    return self.step_back_cycle(previous);
                }
                self.position = Position::At {
                    cycle: previous,
                    sequence: count - 1,
                };
                Ok(true)
            }
            None => {
                self.position = Position::Exhausted;
                Ok(false)
            }
        }
    }

    fn store_for(&mut self, cycle: u32) -> Result<Option<Arc<SegmentStore>>> {
        if let Some((current_cycle, store)) = &self.current {
            if *current_cycle == cycle {
                return Ok(Some(Arc::clone(store)));
            }
        }
        let store = match self
            .directory
            .store_for_cycle(cycle, CreateMode::UseExisting)?
        {
            Some(store) => store,
            None => return Ok(None),
        };
        if let Some((_, previous)) = self.current.take() {
            self.directory.release(&previous);
        }
        self.current = Some((cycle, Arc::clone(&store)));
        Ok(Some(store))
    }
}

impl Drop for Tailer {
    fn drop(&mut self) {
        if let Some((_, store)) = self.current.take() {
            self.directory.release(&store);
        }
    }
}
