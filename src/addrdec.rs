use crate::address;
use color_eyre::eyre::{self, ensure};
use serde::{Deserialize, Serialize};

/// One contiguous bit field inside a sliced address, as `[low, high)` bounds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BitExtent {
    pub low: u8,
    pub high: u8,
}

impl BitExtent {
    #[must_use]
    pub fn width(&self) -> u8 {
        self.high - self.low
    }

    /// Bit mask selecting this field in place.
    #[must_use]
    pub fn mask(&self) -> u64 {
        if self.width() >= 64 {
            return !0;
        }
        ((1u64 << self.width()) - 1) << self.low
    }

    /// Extract the field value, shifted down to bit zero.
    #[must_use]
    pub fn extract(&self, addr: address) -> u64 {
        (addr & self.mask()) >> self.low
    }
}

/// Slices an address into the six DRAM coordinate fields.
///
/// Field order from least to most significant:
/// offset, channel, bank, rank, column, row. Fields are contiguous, so the
/// extents are fully determined by the ordered widths.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AddressSlicer {
    pub offset: BitExtent,
    pub channel: BitExtent,
    pub bank: BitExtent,
    pub rank: BitExtent,
    pub column: BitExtent,
    pub row: BitExtent,
}

impl AddressSlicer {
    fn new(widths: [u32; 6]) -> Self {
        let mut low = 0u8;
        let [offset, channel, bank, rank, column, row] = widths.map(|width| {
            let extent = BitExtent {
                low,
                high: low + width as u8,
            };
            low = extent.high;
            extent
        });
        Self {
            offset,
            channel,
            bank,
            rank,
            column,
            row,
        }
    }

    /// Number of address bits covered by all fields together.
    #[must_use]
    pub fn total_bits(&self) -> u32 {
        u32::from(self.row.high)
    }
}

/// Maps physical addresses onto the (channel, rank, bank, row, column)
/// topology and answers same-line collision queries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DramAddressMapping {
    slicer: AddressSlicer,
}

impl DramAddressMapping {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        channel_width: usize,
        prefetch_size: usize,
        line_size: usize,
        channels: usize,
        banks: usize,
        columns: usize,
        ranks: usize,
        rows: usize,
    ) -> eyre::Result<Self> {
        ensure!(prefetch_size > 0, "prefetch size must be nonzero");
        ensure!(line_size > 0, "line size must be nonzero");
        let transfer = channel_width * prefetch_size;
        ensure!(
            transfer % line_size == 0,
            "transfer size {transfer} is not a multiple of the line size {line_size}"
        );
        ensure!(
            transfer.is_power_of_two(),
            "transfer size must be a power of two, got {transfer}"
        );
        for (name, count) in [
            ("channels", channels),
            ("banks", banks),
            ("ranks", ranks),
            ("rows", rows),
        ] {
            ensure!(
                count > 0 && count.is_power_of_two(),
                "{name} must be a nonzero power of two, got {count}"
            );
        }
        ensure!(
            columns >= prefetch_size
                && columns % prefetch_size == 0
                && (columns / prefetch_size).is_power_of_two(),
            "columns ({columns}) must be a power-of-two multiple of the prefetch size ({prefetch_size})"
        );

        let slicer = AddressSlicer::new([
            transfer.ilog2(),
            channels.ilog2(),
            banks.ilog2(),
            ranks.ilog2(),
            (columns / prefetch_size).ilog2(),
            rows.ilog2(),
        ]);
        ensure!(
            slicer.total_bits() < address::BITS,
            "topology needs {} address bits",
            slicer.total_bits()
        );
        Ok(Self { slicer })
    }

    #[must_use]
    pub fn offset(&self, addr: address) -> u64 {
        self.slicer.offset.extract(addr)
    }

    #[must_use]
    pub fn channel(&self, addr: address) -> u64 {
        self.slicer.channel.extract(addr)
    }

    #[must_use]
    pub fn bank(&self, addr: address) -> u64 {
        self.slicer.bank.extract(addr)
    }

    #[must_use]
    pub fn rank(&self, addr: address) -> u64 {
        self.slicer.rank.extract(addr)
    }

    #[must_use]
    pub fn column(&self, addr: address) -> u64 {
        self.slicer.column.extract(addr)
    }

    #[must_use]
    pub fn row(&self, addr: address) -> u64 {
        self.slicer.row.extract(addr)
    }

    /// Two addresses collide when everything above the offset field matches,
    /// i.e. they name the same (channel, rank, bank, row, column) tuple.
    #[must_use]
    pub fn is_collision(&self, a: address, b: address) -> bool {
        let line = !self.slicer.offset.mask();
        a & line == b & line
    }

    #[must_use]
    pub fn channels(&self) -> usize {
        1 << self.slicer.channel.width()
    }

    #[must_use]
    pub fn ranks(&self) -> usize {
        1 << self.slicer.rank.width()
    }

    #[must_use]
    pub fn banks(&self) -> usize {
        1 << self.slicer.bank.width()
    }

    #[must_use]
    pub fn rows(&self) -> usize {
        1 << self.slicer.row.width()
    }

    /// Column-granularity transfers per row.
    #[must_use]
    pub fn columns(&self) -> usize {
        1 << self.slicer.column.width()
    }

    /// Total addressable bytes across all channels.
    #[must_use]
    pub fn size_bytes(&self) -> u64 {
        1u64 << self.slicer.total_bits()
    }

    #[must_use]
    pub fn slicer(&self) -> &AddressSlicer {
        &self.slicer
    }
}
