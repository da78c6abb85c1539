//! Dual-location n-dimensional buffers.
//!
//! A [`Buffer`] holds the same logical `f32` data in host memory and in
//! device memory, and remembers which of the two is authoritative. Reading
//! through the other location transfers the data first, so a view always
//! observes the latest write no matter where it happened.
//!
//! ```rust
//! use tomoflow::buffer::{Buffer, Location, Requisition};
//! use tomoflow::device::Context;
//!
//! let ctx = Context::sim(1);
//! let queue = ctx.queue(0).unwrap();
//! let mut buffer = Buffer::new(Requisition::new(&[2, 2]), &ctx).unwrap();
//!
//! buffer.host_view_mut(&queue).unwrap().data_mut().fill(3.0);
//! buffer.device_view(&queue).unwrap();
//! assert_eq!(buffer.location(), Location::Device);
//! assert_eq!(buffer.host_view(&queue).unwrap().data(), &[3.0; 4]);
//! ```

use crate::device::{CommandQueue, Context, DeviceArray};
use crate::error::{Error, Result};
use crate::metadata::Metadata;
use crate::observability;
use std::sync::atomic::{AtomicU64, Ordering};

/// Maximum number of dimensions of a buffer.
pub const MAX_DIMS: usize = 8;

/// Shape of a buffer: rank plus one extent per dimension.
///
/// A requisition of rank 0 means "no output"; sink tasks negotiate it.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Requisition {
    rank: usize,
    extents: [usize; MAX_DIMS],
}

impl Requisition {
    /// The empty requisition (rank 0).
    pub const NONE: Self = Self {
        rank: 0,
        extents: [0; MAX_DIMS],
    };

    /// Create a requisition from its extents.
    ///
    /// # Panics
    ///
    /// Panics if more than [`MAX_DIMS`] extents are given.
    pub fn new(extents: &[usize]) -> Self {
        assert!(
            extents.len() <= MAX_DIMS,
            "requisition rank {} exceeds maximum of {}",
            extents.len(),
            MAX_DIMS
        );
        let mut req = Self {
            rank: extents.len(),
            extents: [0; MAX_DIMS],
        };
        req.extents[..extents.len()].copy_from_slice(extents);
        req
    }

    /// Number of dimensions.
    pub fn rank(&self) -> usize {
        self.rank
    }

    /// Extent of each dimension.
    pub fn extents(&self) -> &[usize] {
        &self.extents[..self.rank]
    }

    /// Whether this is the empty requisition.
    pub fn is_none(&self) -> bool {
        self.rank == 0
    }

    /// Number of elements described (0 for rank 0).
    pub fn n_elements(&self) -> usize {
        if self.rank == 0 {
            0
        } else {
            self.extents().iter().product()
        }
    }

    /// Size in bytes of an `f32` buffer of this shape.
    pub fn size_bytes(&self) -> usize {
        self.n_elements() * std::mem::size_of::<f32>()
    }
}

impl std::fmt::Debug for Requisition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Requisition{:?}", self.extents())
    }
}

/// Where a buffer's authoritative data lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Location {
    /// Host memory.
    Host,
    /// Accelerator memory.
    Device,
}

impl Location {
    /// The other location.
    pub fn other(self) -> Self {
        match self {
            Location::Host => Location::Device,
            Location::Device => Location::Host,
        }
    }
}

/// Process-unique buffer identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct BufferId(u64);

impl BufferId {
    fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        Self(NEXT.fetch_add(1, Ordering::Relaxed))
    }

    /// Raw id value.
    pub fn get(self) -> u64 {
        self.0
    }
}

/// An n-dimensional `f32` buffer with a host and a device representation.
pub struct Buffer {
    id: BufferId,
    requisition: Requisition,
    host: Vec<f32>,
    device: DeviceArray,
    context: Context,
    location: Location,
    last_location: Location,
    metadata: Metadata,
}

fn allocate_host(len: usize) -> Result<Vec<f32>> {
    let mut host = Vec::new();
    host.try_reserve_exact(len)
        .map_err(|e| Error::AllocationFailed(format!("{} host elements: {}", len, e)))?;
    host.resize(len, 0.0);
    Ok(host)
}

impl Buffer {
    /// Allocate a buffer of the given shape.
    ///
    /// Host memory is zero-filled and authoritative.
    pub fn new(requisition: Requisition, context: &Context) -> Result<Self> {
        let len = requisition.n_elements();
        Ok(Self {
            id: BufferId::next(),
            requisition,
            host: allocate_host(len)?,
            device: context.allocate(len)?,
            context: context.clone(),
            location: Location::Host,
            last_location: Location::Host,
            metadata: Metadata::new(),
        })
    }

    /// Allocate a buffer with the same shape and context. Contents and
    /// metadata are not copied.
    pub fn dup(&self) -> Result<Self> {
        Self::new(self.requisition, &self.context)
    }

    /// Unique id of this buffer.
    pub fn id(&self) -> BufferId {
        self.id
    }

    /// Current shape.
    pub fn requisition(&self) -> Requisition {
        self.requisition
    }

    /// Size of the data in bytes.
    pub fn size(&self) -> usize {
        self.requisition.size_bytes()
    }

    /// Authoritative location.
    pub fn location(&self) -> Location {
        self.location
    }

    /// Location that was authoritative before the last change.
    pub fn last_location(&self) -> Location {
        self.last_location
    }

    /// Context the buffer was allocated from.
    pub fn context(&self) -> &Context {
        &self.context
    }

    /// Buffer metadata.
    pub fn metadata(&self) -> &Metadata {
        &self.metadata
    }

    /// Mutable buffer metadata.
    pub fn metadata_mut(&mut self) -> &mut Metadata {
        &mut self.metadata
    }

    /// Whether the buffer has exactly the given shape.
    pub fn compare_shape(&self, requisition: &Requisition) -> bool {
        self.requisition == *requisition
    }

    /// Reallocate both representations for a new shape.
    ///
    /// The old contents are dropped; the new host memory is zero-filled
    /// and authoritative.
    pub fn resize(&mut self, requisition: Requisition) -> Result<()> {
        let len = requisition.n_elements();
        let host = allocate_host(len)?;
        let device = self.context.allocate(len)?;
        self.host = host;
        self.device = device;
        self.requisition = requisition;
        self.set_location(Location::Host);
        Ok(())
    }

    /// Zero the host data and make it authoritative.
    pub fn clear(&mut self) {
        self.host.fill(0.0);
        self.set_location(Location::Host);
    }

    /// Mark the location opposite to `location` authoritative, without
    /// copying anything.
    ///
    /// Use this before overwriting the whole buffer through the other
    /// location, to skip a pointless transfer.
    pub fn discard_location(&mut self, location: Location) {
        self.set_location(location.other());
    }

    fn set_location(&mut self, location: Location) {
        if self.location != location {
            self.last_location = self.location;
            self.location = location;
        }
    }

    /// Make `location` authoritative, transferring the data there if needed.
    pub fn sync_to(&mut self, location: Location, queue: &CommandQueue) -> Result<()> {
        if self.location == location {
            return Ok(());
        }

        match location {
            Location::Host => queue.read(&self.device, &mut self.host)?,
            Location::Device => queue.write(&self.host, &mut self.device)?,
        }

        tracing::trace!(
            buffer = self.id.get(),
            from = ?self.location,
            to = ?location,
            bytes = self.size(),
            "buffer transfer"
        );
        observability::record_transfer(location, self.size());
        self.set_location(location);
        Ok(())
    }

    /// Read access through host memory.
    pub fn host_view(&mut self, queue: &CommandQueue) -> Result<HostView<'_>> {
        self.sync_to(Location::Host, queue)?;
        Ok(self.view_host())
    }

    /// Write access through host memory.
    pub fn host_view_mut(&mut self, queue: &CommandQueue) -> Result<HostViewMut<'_>> {
        self.sync_to(Location::Host, queue)?;
        Ok(HostViewMut {
            data: &mut self.host,
            requisition: self.requisition,
            metadata: &mut self.metadata,
        })
    }

    /// Read access through device memory.
    pub fn device_view(&mut self, queue: &CommandQueue) -> Result<DeviceView<'_>> {
        self.sync_to(Location::Device, queue)?;
        Ok(self.view_device())
    }

    /// Write access through device memory.
    pub fn device_view_mut(&mut self, queue: &CommandQueue) -> Result<DeviceViewMut<'_>> {
        self.sync_to(Location::Device, queue)?;
        Ok(DeviceViewMut {
            array: &mut self.device,
            requisition: self.requisition,
            metadata: &mut self.metadata,
        })
    }

    /// Host view of a buffer already synchronized to the host.
    pub(crate) fn view_host(&self) -> HostView<'_> {
        debug_assert_eq!(self.location, Location::Host);
        HostView {
            data: &self.host,
            requisition: self.requisition,
            metadata: &self.metadata,
        }
    }

    /// Device view of a buffer already synchronized to the device.
    pub(crate) fn view_device(&self) -> DeviceView<'_> {
        debug_assert_eq!(self.location, Location::Device);
        DeviceView {
            array: &self.device,
            requisition: self.requisition,
            metadata: &self.metadata,
        }
    }

    /// Copy the contents of `src` into `dst`.
    ///
    /// A `dst` of another shape is [resized](Buffer::resize) to `src`'s
    /// requisition first, which leaves it on the host. Data is read from
    /// `src`'s authoritative location and written to `dst`'s authoritative
    /// location.
    pub fn copy(src: &Buffer, dst: &mut Buffer, queue: &CommandQueue) -> Result<()> {
        if !dst.compare_shape(&src.requisition) {
            dst.resize(src.requisition)?;
        }

        match (src.location, dst.location) {
            (Location::Host, Location::Host) => dst.host.copy_from_slice(&src.host),
            (Location::Host, Location::Device) => queue.write(&src.host, &mut dst.device)?,
            (Location::Device, Location::Host) => queue.read(&src.device, &mut dst.host)?,
            (Location::Device, Location::Device) => queue.copy(&src.device, &mut dst.device)?,
        }
        Ok(())
    }

    /// Copy all metadata fields of `src` into `dst`, overwriting equal keys.
    pub fn copy_metadata(src: &Buffer, dst: &mut Buffer) {
        dst.metadata.merge_from(&src.metadata);
    }

    /// Largest host value (transfers to the host if needed).
    pub fn max(&mut self, queue: &CommandQueue) -> Result<f32> {
        let view = self.host_view(queue)?;
        Ok(view.data().iter().copied().fold(f32::NEG_INFINITY, f32::max))
    }

    /// Smallest host value (transfers to the host if needed).
    pub fn min(&mut self, queue: &CommandQueue) -> Result<f32> {
        let view = self.host_view(queue)?;
        Ok(view.data().iter().copied().fold(f32::INFINITY, f32::min))
    }
}

impl std::fmt::Debug for Buffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Buffer")
            .field("id", &self.id.get())
            .field("requisition", &self.requisition)
            .field("location", &self.location)
            .field("metadata", &self.metadata.len())
            .finish()
    }
}

/// Read-only host view handed to CPU tasks.
#[derive(Clone, Copy)]
pub struct HostView<'a> {
    data: &'a [f32],
    requisition: Requisition,
    metadata: &'a Metadata,
}

impl<'a> HostView<'a> {
    /// The data, in row-major order.
    pub fn data(&self) -> &'a [f32] {
        self.data
    }

    /// Shape of the data.
    pub fn requisition(&self) -> &Requisition {
        &self.requisition
    }

    /// Metadata of the underlying buffer.
    pub fn metadata(&self) -> &'a Metadata {
        self.metadata
    }
}

/// Writable host view.
pub struct HostViewMut<'a> {
    data: &'a mut [f32],
    requisition: Requisition,
    metadata: &'a mut Metadata,
}

impl HostViewMut<'_> {
    /// The data, in row-major order.
    pub fn data(&self) -> &[f32] {
        &*self.data
    }

    /// Mutable data.
    pub fn data_mut(&mut self) -> &mut [f32] {
        &mut *self.data
    }

    /// Shape of the data.
    pub fn requisition(&self) -> &Requisition {
        &self.requisition
    }

    /// Metadata of the underlying buffer.
    pub fn metadata(&self) -> &Metadata {
        &*self.metadata
    }

    /// Mutable metadata of the underlying buffer.
    pub fn metadata_mut(&mut self) -> &mut Metadata {
        &mut *self.metadata
    }
}

/// Read-only device view handed to device tasks.
#[derive(Clone, Copy)]
pub struct DeviceView<'a> {
    array: &'a DeviceArray,
    requisition: Requisition,
    metadata: &'a Metadata,
}

impl<'a> DeviceView<'a> {
    /// The device array.
    pub fn array(&self) -> &'a DeviceArray {
        self.array
    }

    /// Shape of the data.
    pub fn requisition(&self) -> &Requisition {
        &self.requisition
    }

    /// Metadata of the underlying buffer.
    pub fn metadata(&self) -> &'a Metadata {
        self.metadata
    }
}

/// Writable device view.
pub struct DeviceViewMut<'a> {
    array: &'a mut DeviceArray,
    requisition: Requisition,
    metadata: &'a mut Metadata,
}

impl DeviceViewMut<'_> {
    /// The device array.
    pub fn array(&self) -> &DeviceArray {
        &*self.array
    }

    /// Mutable device array.
    pub fn array_mut(&mut self) -> &mut DeviceArray {
        &mut *self.array
    }

    /// Shape of the data.
    pub fn requisition(&self) -> &Requisition {
        &self.requisition
    }

    /// Metadata of the underlying buffer.
    pub fn metadata(&self) -> &Metadata {
        &*self.metadata
    }

    /// Mutable metadata of the underlying buffer.
    pub fn metadata_mut(&mut self) -> &mut Metadata {
        &mut *self.metadata
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn setup() -> (Context, CommandQueue) {
        let ctx = Context::sim(1);
        let queue = ctx.queue(0).unwrap();
        (ctx, queue)
    }

    #[test]
    fn test_requisition() {
        let req = Requisition::new(&[4, 3]);
        assert_eq!(req.rank(), 2);
        assert_eq!(req.extents(), &[4, 3]);
        assert_eq!(req.n_elements(), 12);
        assert_eq!(req.size_bytes(), 48);
        assert!(!req.is_none());

        assert!(Requisition::NONE.is_none());
        assert_eq!(Requisition::NONE.n_elements(), 0);
        assert_eq!(Requisition::new(&[]), Requisition::NONE);
    }

    #[test]
    #[should_panic]
    fn test_requisition_rank_limit() {
        Requisition::new(&[1; MAX_DIMS + 1]);
    }

    #[test]
    fn test_new_buffer_is_zeroed_on_host() {
        let (ctx, queue) = setup();
        let mut buffer = Buffer::new(Requisition::new(&[8]), &ctx).unwrap();
        assert_eq!(buffer.location(), Location::Host);
        assert_eq!(buffer.size(), 32);
        assert!(buffer.host_view(&queue).unwrap().data().iter().all(|&v| v == 0.0));
    }

    #[test]
    fn test_location_round_trip() {
        let (ctx, stats) = Context::sim_with_stats(1);
        let queue = ctx.queue(0).unwrap();
        let mut buffer = Buffer::new(Requisition::new(&[2, 3]), &ctx).unwrap();
        let original: Vec<f32> = (0..6).map(|i| i as f32 * 1.5).collect();

        buffer
            .host_view_mut(&queue)
            .unwrap()
            .data_mut()
            .copy_from_slice(&original);

        buffer.device_view(&queue).unwrap();
        assert_eq!(buffer.location(), Location::Device);
        assert_eq!(buffer.last_location(), Location::Host);

        let view = buffer.host_view(&queue).unwrap();
        assert_eq!(view.data(), original.as_slice());
        assert_eq!(stats.host_to_device(), 1);
        assert_eq!(stats.device_to_host(), 1);
    }

    #[test]
    fn test_same_location_does_not_transfer() {
        let (ctx, stats) = Context::sim_with_stats(1);
        let queue = ctx.queue(0).unwrap();
        let mut buffer = Buffer::new(Requisition::new(&[4]), &ctx).unwrap();

        buffer.host_view(&queue).unwrap();
        buffer.host_view_mut(&queue).unwrap();
        assert_eq!(stats.total(), 0);
    }

    #[test]
    fn test_discard_location_then_write_is_visible() {
        let (ctx, stats) = Context::sim_with_stats(1);
        let queue = ctx.queue(0).unwrap();
        let mut buffer = Buffer::new(Requisition::new(&[4]), &ctx).unwrap();

        // Push stale data to the device, then make the host authoritative
        // again without copying back.
        buffer.device_view_mut(&queue).unwrap();
        buffer.discard_location(Location::Device);
        assert_eq!(buffer.location(), Location::Host);
        assert_eq!(stats.device_to_host(), 0);

        buffer.host_view_mut(&queue).unwrap().data_mut().fill(7.0);

        let view = buffer.device_view(&queue).unwrap();
        assert_eq!(view.array().sim_data(), &[7.0; 4]);
    }

    #[test]
    fn test_discard_host_then_device_write() {
        let (ctx, queue) = setup();
        let mut buffer = Buffer::new(Requisition::new(&[3]), &ctx).unwrap();

        buffer.discard_location(Location::Host);
        assert_eq!(buffer.location(), Location::Device);

        buffer
            .device_view_mut(&queue)
            .unwrap()
            .array_mut()
            .sim_data_mut()
            .copy_from_slice(&[1.0, 2.0, 3.0]);

        assert_eq!(buffer.host_view(&queue).unwrap().data(), &[1.0, 2.0, 3.0]);
    }

    #[test]
    fn test_copy_by_location() {
        let (ctx, stats) = Context::sim_with_stats(1);
        let queue = ctx.queue(0).unwrap();
        let req = Requisition::new(&[4]);

        let mut src = Buffer::new(req, &ctx).unwrap();
        src.host_view_mut(&queue).unwrap().data_mut().fill(2.0);

        // host -> host
        let mut dst = Buffer::new(req, &ctx).unwrap();
        Buffer::copy(&src, &mut dst, &queue).unwrap();
        assert_eq!(stats.total(), 0);
        assert_eq!(dst.host_view(&queue).unwrap().data(), &[2.0; 4]);

        // host -> device
        let mut dst = Buffer::new(req, &ctx).unwrap();
        dst.discard_location(Location::Host);
        Buffer::copy(&src, &mut dst, &queue).unwrap();
        assert_eq!(dst.location(), Location::Device);
        assert_eq!(stats.host_to_device(), 1);
        assert_eq!(dst.host_view(&queue).unwrap().data(), &[2.0; 4]);

        // device -> device
        src.device_view(&queue).unwrap();
        let mut dst = Buffer::new(req, &ctx).unwrap();
        dst.discard_location(Location::Host);
        Buffer::copy(&src, &mut dst, &queue).unwrap();
        assert_eq!(stats.device_to_device(), 1);
        assert_eq!(dst.device_view(&queue).unwrap().array().sim_data(), &[2.0; 4]);
    }

    #[test]
    fn test_copy_resizes_destination() {
        let (ctx, queue) = setup();
        let mut src = Buffer::new(Requisition::new(&[2, 2]), &ctx).unwrap();
        src.host_view_mut(&queue).unwrap().data_mut().fill(3.0);

        // Different element count.
        let mut dst = Buffer::new(Requisition::new(&[3]), &ctx).unwrap();
        Buffer::copy(&src, &mut dst, &queue).unwrap();
        assert_eq!(dst.requisition(), Requisition::new(&[2, 2]));
        assert_eq!(dst.host_view(&queue).unwrap().data(), &[3.0; 4]);

        // Same element count, other shape.
        let mut dst = Buffer::new(Requisition::new(&[4]), &ctx).unwrap();
        dst.device_view(&queue).unwrap();
        Buffer::copy(&src, &mut dst, &queue).unwrap();
        assert_eq!(dst.requisition(), Requisition::new(&[2, 2]));
        assert_eq!(dst.location(), Location::Host);
        assert_eq!(dst.host_view(&queue).unwrap().data(), &[3.0; 4]);
    }

    #[test]
    fn test_resize() {
        let (ctx, queue) = setup();
        let mut buffer = Buffer::new(Requisition::new(&[2]), &ctx).unwrap();
        buffer.device_view(&queue).unwrap();

        let req = Requisition::new(&[3, 3]);
        assert!(!buffer.compare_shape(&req));
        buffer.resize(req).unwrap();
        assert!(buffer.compare_shape(&req));
        assert_eq!(buffer.location(), Location::Host);
        assert_eq!(buffer.host_view(&queue).unwrap().data().len(), 9);
    }

    #[test]
    fn test_transfer_failure_keeps_location() {
        let (ctx, stats) = Context::sim_with_stats(1);
        let queue = ctx.queue(0).unwrap();
        let mut buffer = Buffer::new(Requisition::new(&[2]), &ctx).unwrap();

        stats.set_fail(true);
        assert!(matches!(
            buffer.device_view(&queue),
            Err(Error::Transfer(_))
        ));
        assert_eq!(buffer.location(), Location::Host);
    }

    #[test]
    fn test_metadata_copy_and_dup() {
        let (ctx, queue) = setup();
        let mut src = Buffer::new(Requisition::new(&[2]), &ctx).unwrap();
        src.metadata_mut().set("index", 3i64);
        src.host_view_mut(&queue).unwrap().data_mut().fill(1.0);

        let mut dst = src.dup().unwrap();
        assert_ne!(dst.id(), src.id());
        assert!(dst.metadata().is_empty());
        assert_eq!(dst.host_view(&queue).unwrap().data(), &[0.0, 0.0]);

        Buffer::copy_metadata(&src, &mut dst);
        assert_eq!(dst.metadata().get_int("index"), Some(3));
    }

    #[test]
    fn test_min_max_and_clear() {
        let (ctx, queue) = setup();
        let mut buffer = Buffer::new(Requisition::new(&[3]), &ctx).unwrap();
        buffer
            .host_view_mut(&queue)
            .unwrap()
            .data_mut()
            .copy_from_slice(&[-1.0, 4.0, 2.0]);
        buffer.device_view(&queue).unwrap();

        assert_eq!(buffer.max(&queue).unwrap(), 4.0);
        assert_eq!(buffer.min(&queue).unwrap(), -1.0);

        buffer.device_view(&queue).unwrap();
        buffer.clear();
        assert_eq!(buffer.location(), Location::Host);
        assert_eq!(buffer.host_view(&queue).unwrap().data(), &[0.0; 3]);
    }
}
