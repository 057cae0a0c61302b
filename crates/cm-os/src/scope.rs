//! # Command Buffer Scope
//!
//! RAII guard over an acquired command buffer. Dropping the guard without
//! submitting rewinds the buffer to where it was acquired and returns it,
//! so a failed composition never leaves a partial sequence behind.

use cm_cmd::{Checkpoint, CommandBuffer};
use cm_core::Result;

use crate::traits::OsInterface;

/// Acquired command buffer that rolls back unless submitted
#[derive(Debug)]
pub struct CommandBufferScope<'a, O: OsInterface + ?Sized> {
    os: &'a mut O,
    buffer: CommandBuffer,
    start: Checkpoint,
    done: bool,
}

impl<'a, O: OsInterface + ?Sized> CommandBufferScope<'a, O> {
    /// Acquire the current context's command buffer
    pub fn acquire(os: &'a mut O) -> Result<Self> {
        let buffer = os.get_command_buffer()?;
        let start = buffer.checkpoint();
        Ok(Self {
            os,
            buffer,
            start,
            done: false,
        })
    }

    /// Position recorded at acquisition
    pub fn start(&self) -> Checkpoint {
        self.start
    }

    /// The buffer
    pub fn buffer(&mut self) -> &mut CommandBuffer {
        &mut self.buffer
    }

    /// The OS interface
    pub fn os(&mut self) -> &mut O {
        &mut *self.os
    }

    /// Both at once
    pub fn parts(&mut self) -> (&mut O, &mut CommandBuffer) {
        (&mut *self.os, &mut self.buffer)
    }

    /// Return the buffer and submit it
    ///
    /// If submission fails the buffer is taken back, rewound and returned.
    pub fn submit(mut self) -> Result<()> {
        self.done = true;
        let buffer = core::mem::replace(&mut self.buffer, CommandBuffer::new(0));
        self.os.return_command_buffer(buffer);
        if let Err(e) = self.os.submit_command_buffer() {
            self.os.discard_registrations();
            if let Ok(mut buffer) = self.os.get_command_buffer() {
                buffer.rewind(self.start);
                self.os.return_command_buffer(buffer);
            }
            return Err(e);
        }
        Ok(())
    }
}

impl<O: OsInterface + ?Sized> Drop for CommandBufferScope<'_, O> {
    fn drop(&mut self) {
        if self.done {
            return;
        }
        let mut buffer = core::mem::replace(&mut self.buffer, CommandBuffer::new(0));
        buffer.rewind(self.start);
        self.os.discard_registrations();
        self.os.return_command_buffer(buffer);
    }
}
