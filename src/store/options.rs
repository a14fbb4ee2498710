//! Per-read options.

use crate::address::Address;

/// Flags controlling a single read.
#[derive(Debug, Clone, Copy)]
pub struct ReadOptions {
    /// Skip read-cache records when looking the key up.
    pub disable_read_cache_reads: bool,
    /// Do not copy a device-resident result into the read cache.
    pub disable_read_cache_updates: bool,
    /// Copy a device-resident result to the hybrid-log tail instead of the
    /// read cache.
    pub copy_reads_to_tail: bool,
    /// Serve only from the device, ignoring in-memory records.
    pub copy_from_device_only: bool,
    /// Clear the modified bit on the record that served the read.
    pub reset_modified: bool,
    /// Stop the traversal once addresses drop below this; `INVALID`
    /// disables the cutoff.
    pub stop_address: Address,
}

impl Default for ReadOptions {
    fn default() -> Self {
        Self {
            disable_read_cache_reads: false,
            disable_read_cache_updates: false,
            copy_reads_to_tail: false,
            copy_from_device_only: false,
            reset_modified: false,
            stop_address: Address::INVALID,
        }
    }
}

impl ReadOptions {
    /// Default options.
    pub fn new() -> Self {
        Self::default()
    }

    /// Skip read-cache records during lookup.
    pub fn with_disable_read_cache_reads(mut self, v: bool) -> Self {
        self.disable_read_cache_reads = v;
        self
    }

    /// Do not install device-resident results into the read cache.
    pub fn with_disable_read_cache_updates(mut self, v: bool) -> Self {
        self.disable_read_cache_updates = v;
        self
    }

    /// Copy device-resident results to the hybrid-log tail.
    pub fn with_copy_reads_to_tail(mut self, v: bool) -> Self {
        self.copy_reads_to_tail = v;
        self
    }

    /// Serve only from the device.
    pub fn with_copy_from_device_only(mut self, v: bool) -> Self {
        self.copy_from_device_only = v;
        self
    }

    /// Clear the modified bit on the serving record.
    pub fn with_reset_modified(mut self, v: bool) -> Self {
        self.reset_modified = v;
        self
    }

    /// Set the traversal cutoff address.
    pub fn with_stop_address(mut self, address: Address) -> Self {
        self.stop_address = address;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let opts = ReadOptions::default();
        assert!(!opts.disable_read_cache_reads);
        assert!(!opts.copy_reads_to_tail);
        assert_eq!(opts.stop_address, Address::INVALID);
    }

    #[test]
    fn test_builder() {
        let opts = ReadOptions::new()
            .with_copy_reads_to_tail(true)
            .with_stop_address(Address::from_control(128));
        assert!(opts.copy_reads_to_tail);
        assert_eq!(opts.stop_address.control(), 128);
    }
}
