use super::device::{
    BitstreamBuffer, DeviceCall, DeviceResultExt, EncodeDevice, InputSurface, MappedInput,
    RegisteredResource,
};
use crate::{error::DeviceStatus, NvEncError, Result};
use slot_ring::{ReaderItem, SlotRing, WriterItem};

/// Device resources behind one position of the ring.
///
/// A slot is either fully allocated or empty. `mapped` is only set while a submitted frame
/// waits to be drained.
#[derive(Debug, Default)]
pub(crate) struct Slot {
    output: Option<BitstreamBuffer>,
    surface: Option<InputSurface>,
    registered: Option<RegisteredResource>,
    pub(crate) mapped: Option<MappedInput>,
}

impl Slot {
    #[inline]
    pub(crate) fn output(&self) -> Result<BitstreamBuffer> {
        self.output.ok_or(NvEncError::Device {
            call: DeviceCall::LockBitstream,
            status: DeviceStatus::InvalidPtr,
        })
    }

    /// Surface and its registration, used to submit a frame.
    #[inline]
    pub(crate) fn input(&self) -> Result<(InputSurface, RegisteredResource)> {
        match (self.surface, self.registered) {
            (Some(surface), Some(registered)) => Ok((surface, registered)),
            _ => Err(NvEncError::Device {
                call: DeviceCall::MapInputResource,
                status: DeviceStatus::ResourceNotRegistered,
            }),
        }
    }

    #[inline]
    fn is_allocated(&self) -> bool {
        self.output.is_some() || self.surface.is_some() || self.registered.is_some()
    }

    /// Allocates every resource of the slot or none of them.
    fn allocate<D: EncodeDevice + ?Sized>(device: &mut D, width: u32, height: u32) -> Result<Self> {
        let output = device
            .create_bitstream_buffer()
            .check(DeviceCall::CreateBitstreamBuffer)?;

        let surface = match device
            .create_input_surface(width, height)
            .check(DeviceCall::CreateInputSurface)
        {
            Ok(surface) => surface,
            Err(err) => {
                log_failure(
                    device.destroy_bitstream_buffer(output),
                    DeviceCall::DestroyBitstreamBuffer,
                );
                return Err(err);
            }
        };

        let registered = match device
            .register_resource(surface)
            .check(DeviceCall::RegisterResource)
        {
            Ok(registered) => registered,
            Err(err) => {
                log_failure(
                    device.destroy_input_surface(surface),
                    DeviceCall::DestroyInputSurface,
                );
                log_failure(
                    device.destroy_bitstream_buffer(output),
                    DeviceCall::DestroyBitstreamBuffer,
                );
                return Err(err);
            }
        };

        Ok(Slot {
            output: Some(output),
            surface: Some(surface),
            registered: Some(registered),
            mapped: None,
        })
    }

    /// Frees whatever the slot still holds. Failures are logged and the handle is dropped.
    fn release<D: EncodeDevice + ?Sized>(&mut self, device: &mut D) {
        if let Some(mapped) = self.mapped.take() {
            log_failure(device.unmap_input(mapped), DeviceCall::UnmapInputResource);
        }
        if let Some(registered) = self.registered.take() {
            log_failure(
                device.unregister_resource(registered),
                DeviceCall::UnregisterResource,
            );
        }
        if let Some(surface) = self.surface.take() {
            log_failure(
                device.destroy_input_surface(surface),
                DeviceCall::DestroyInputSurface,
            );
        }
        if let Some(output) = self.output.take() {
            log_failure(
                device.destroy_bitstream_buffer(output),
                DeviceCall::DestroyBitstreamBuffer,
            );
        }
    }
}

fn log_failure(result: std::result::Result<(), DeviceStatus>, call: DeviceCall) {
    if let Err(status) = result {
        log::warn!("{call} failed during teardown: {status} ({})", status.code());
    }
}

/// Fixed set of slots submitted and drained in ring order.
#[derive(Debug)]
pub(crate) struct ResourcePool {
    ring: SlotRing<Slot>,
}

impl ResourcePool {
    pub(crate) fn new(count: usize) -> Self {
        ResourcePool {
            ring: SlotRing::from_fn(count, |_| Slot::default()),
        }
    }

    /// Allocates the slots in order. A failing slot is rolled back; the slots before it stay
    /// allocated until [`ResourcePool::release`].
    pub(crate) fn allocate<D: EncodeDevice + ?Sized>(
        &mut self,
        device: &mut D,
        width: u32,
        height: u32,
    ) -> Result<()> {
        for (index, slot) in self.ring.iter_mut().enumerate() {
            if slot.is_allocated() {
                continue;
            }
            *slot = Slot::allocate(device, width, height).map_err(|err| {
                log::error!("failed to allocate buffer slot {index}");
                err
            })?;
        }
        Ok(())
    }

    /// Frees every slot. Safe to call on a partially allocated or already released pool.
    pub(crate) fn release<D: EncodeDevice + ?Sized>(&mut self, device: &mut D) {
        for slot in self.ring.iter_mut() {
            slot.release(device);
        }
    }

    /// Slot the next frame is submitted into. `None` if every slot is in flight.
    #[inline]
    pub(crate) fn writer_slot(&mut self) -> Option<WriterItem<'_, Slot>> {
        self.ring.writer_item()
    }

    /// Oldest in-flight slot.
    #[inline]
    pub(crate) fn reader_slot(&mut self) -> Option<ReaderItem<'_, Slot>> {
        self.ring.reader_item()
    }

    #[inline]
    pub(crate) fn queued(&self) -> usize {
        self.ring.len()
    }

    #[inline]
    pub(crate) fn capacity(&self) -> usize {
        self.ring.capacity()
    }

    #[inline]
    pub(crate) fn next_index(&self) -> usize {
        self.ring.head()
    }

    #[inline]
    pub(crate) fn current_index(&self) -> usize {
        self.ring.tail()
    }

    pub(crate) fn allocated_slots(&self) -> usize {
        self.ring.iter().filter(|slot| slot.is_allocated()).count()
    }
}

/// Everything a session acquired from the device, released through one path.
#[derive(Debug)]
pub(crate) struct SessionResources {
    pub(crate) session_open: bool,
    pub(crate) pool: ResourcePool,
}

impl SessionResources {
    pub(crate) fn new() -> Self {
        SessionResources {
            session_open: false,
            pool: ResourcePool::new(0),
        }
    }

    /// Frees the pool, then destroys the encoder. Calling it again does nothing.
    pub(crate) fn release<D: EncodeDevice + ?Sized>(&mut self, device: &mut D) {
        device.enter_graphics();
        self.pool.release(device);
        device.leave_graphics();

        if std::mem::take(&mut self.session_open) {
            log_failure(device.destroy_encoder(), DeviceCall::DestroyEncoder);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::MockDevice;

    fn initialized_device() -> MockDevice {
        let mut device = MockDevice::new();
        device.open_session().unwrap();
        let config = crate::encoder::config::negotiate(
            &mut device,
            &Default::default(),
            &crate::VideoInfo::new(64, 64, 30, 1),
            false,
        )
        .unwrap();
        device.initialize(&config.params).unwrap();
        device
    }

    #[test]
    fn allocate_and_release() {
        let mut device = initialized_device();
        let mut pool = ResourcePool::new(4);

        device.enter_graphics();
        pool.allocate(&mut device, 64, 64).unwrap();
        device.leave_graphics();
        assert_eq!(pool.allocated_slots(), 4);
        assert_eq!(device.live_resources(), 12);

        let mut resources = SessionResources {
            session_open: true,
            pool,
        };
        resources.release(&mut device);
        assert_eq!(device.live_resources(), 0);
        assert!(device.destroyed());

        // Second release is a no-op
        resources.release(&mut device);
        assert_eq!(device.calls(DeviceCall::DestroyEncoder), 1);
    }

    #[test]
    fn failing_slot_is_rolled_back() {
        let mut device = initialized_device();
        device.fail(DeviceCall::RegisterResource, 2, DeviceStatus::OutOfMemory);
        let mut pool = ResourcePool::new(4);

        device.enter_graphics();
        let err = pool.allocate(&mut device, 64, 64).unwrap_err();
        device.leave_graphics();

        assert_eq!(err.status(), Some(DeviceStatus::OutOfMemory));
        // Slots 0 and 1 stay, slot 2 was rolled back, slot 3 was never touched
        assert_eq!(pool.allocated_slots(), 2);
        assert_eq!(device.live_resources(), 6);

        pool.release(&mut device);
        assert_eq!(device.live_resources(), 0);
    }

    #[test]
    fn rollback_continues_past_teardown_failures() {
        let mut device = initialized_device();
        device.fail(DeviceCall::RegisterResource, 0, DeviceStatus::OutOfMemory);
        device.fail(DeviceCall::DestroyInputSurface, 0, DeviceStatus::Graphics);

        device.enter_graphics();
        let err = Slot::allocate(&mut device, 64, 64).unwrap_err();
        device.leave_graphics();

        assert_eq!(err.status(), Some(DeviceStatus::OutOfMemory));
        assert_eq!(device.calls(DeviceCall::DestroyInputSurface), 1);
        assert_eq!(device.calls(DeviceCall::DestroyBitstreamBuffer), 1);
        // Only the surface whose destruction failed is left behind
        assert_eq!(device.live_resources(), 1);
    }

    #[test]
    fn writer_and_reader_slots_follow_the_ring() {
        let mut device = initialized_device();
        let mut pool = ResourcePool::new(2);
        pool.allocate(&mut device, 64, 64).unwrap();

        let slot = pool.writer_slot().unwrap();
        assert_eq!(slot.index(), 0);
        assert!(slot.input().is_ok());
        slot.commit();
        pool.writer_slot().unwrap().commit();
        assert!(pool.writer_slot().is_none());
        assert_eq!(pool.queued(), 2);

        let slot = pool.reader_slot().unwrap();
        assert_eq!(slot.index(), 0);
        slot.release();
        assert_eq!(pool.current_index(), 1);
        assert_eq!(pool.next_index(), 0);
        assert_eq!(pool.capacity(), 2);

        pool.release(&mut device);
    }

    #[test]
    fn empty_slot_reports_missing_resources() {
        let slot = Slot::default();
        assert!(slot.output().is_err());
        assert_eq!(
            slot.input().unwrap_err().status(),
            Some(DeviceStatus::ResourceNotRegistered)
        );
    }
}
