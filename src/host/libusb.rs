//! libusb implementation of the [`UsbDevice`] backend.

use std::collections::HashMap;
use std::ffi::CStr;
use std::io;
use std::mem::MaybeUninit;
use std::os::raw::{c_int, c_uint, c_void};
use std::ptr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use libusb1_sys as libusb;
use libusb1_sys::constants::{
    LIBUSB_CONTROL_SETUP_SIZE, LIBUSB_ERROR_ACCESS, LIBUSB_ERROR_INTERRUPTED,
    LIBUSB_ERROR_NO_DEVICE, LIBUSB_ERROR_NOT_FOUND, LIBUSB_ERROR_NOT_SUPPORTED,
    LIBUSB_ERROR_PIPE, LIBUSB_ERROR_TIMEOUT,
    LIBUSB_SPEED_FULL, LIBUSB_SPEED_HIGH, LIBUSB_SPEED_LOW, LIBUSB_SPEED_SUPER,
    LIBUSB_TRANSFER_CANCELLED, LIBUSB_TRANSFER_COMPLETED, LIBUSB_TRANSFER_NO_DEVICE,
    LIBUSB_TRANSFER_OVERFLOW, LIBUSB_TRANSFER_STALL, LIBUSB_TRANSFER_TIMED_OUT,
    LIBUSB_TRANSFER_TYPE_BULK, LIBUSB_TRANSFER_TYPE_BULK_STREAM,
    LIBUSB_TRANSFER_TYPE_CONTROL, LIBUSB_TRANSFER_TYPE_INTERRUPT,
    LIBUSB_TRANSFER_TYPE_ISOCHRONOUS,
};

use super::backend::{
    CompletionFn, ConfigDescriptor, DeviceDescriptor, DeviceSpeed, EndpointDescriptor,
    InterfaceDescriptor, IsoPacketResult, TransferHandle, TransferRequest, TransferResult,
    TransferStatus, UsbDevice,
};

#[derive(Copy, Clone)]
struct CtxPtr(*mut libusb::libusb_context);

unsafe impl Send for CtxPtr {}
unsafe impl Sync for CtxPtr {}

/// RAII wrapper owning a libusb context and a background event thread.
pub struct LibusbContext {
    ptr: CtxPtr,
    running: Arc<AtomicBool>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl LibusbContext {
    pub fn new() -> io::Result<Arc<Self>> {
        let mut ctx = ptr::null_mut();
        let rc = unsafe { libusb::libusb_init(&mut ctx) };
        if rc < 0 {
            return Err(io::Error::new(
                io::ErrorKind::Other,
                format!("libusb init failed: {rc}"),
            ));
        }

        let ctx = CtxPtr(ctx);
        let running = Arc::new(AtomicBool::new(true));
        let running_thread = running.clone();

        // Poll libusb for asynchronous transfer completion; 10ms keeps
        // completion latency low without spinning.
        let handle = std::thread::Builder::new()
            .name("usb-events".into())
            .spawn(move || {
                let ctx = ctx;
                let mut timeval = libc::timeval {
                    tv_sec: 0,
                    tv_usec: 10_000,
                };
                while running_thread.load(Ordering::SeqCst) {
                    let rc = unsafe {
                        libusb::libusb_handle_events_timeout_completed(
                            ctx.0,
                            &mut timeval,
                            ptr::null_mut(),
                        )
                    };
                    if rc == LIBUSB_ERROR_INTERRUPTED {
                        continue;
                    }
                    if rc < 0 && running_thread.load(Ordering::SeqCst) {
                        std::thread::yield_now();
                    }
                }
            })
            .map_err(|e| {
                io::Error::new(
                    io::ErrorKind::Other,
                    format!("failed to spawn usb event thread: {e}"),
                )
            })?;

        Ok(Arc::new(LibusbContext {
            ptr: ctx,
            running,
            thread: Mutex::new(Some(handle)),
        }))
    }
}

impl Drop for LibusbContext {
    fn drop(&mut self) {
        self.running.store(false, Ordering::SeqCst);
        if let Ok(mut guard) = self.thread.lock() {
            if let Some(handle) = guard.take() {
                let _ = handle.join();
            }
        }
        unsafe { libusb::libusb_exit(self.ptr.0) };
    }
}

struct HandleWrapper(*mut libusb::libusb_device_handle);

unsafe impl Send for HandleWrapper {}
unsafe impl Sync for HandleWrapper {}

impl Drop for HandleWrapper {
    fn drop(&mut self) {
        unsafe { libusb::libusb_close(self.0) };
    }
}

struct DevPtr(*mut libusb::libusb_device);

unsafe impl Send for DevPtr {}
unsafe impl Sync for DevPtr {}

impl Drop for DevPtr {
    fn drop(&mut self) {
        unsafe { libusb::libusb_unref_device(self.0) };
    }
}

/// An opened libusb device implementing the engine's backend trait.
pub struct LibusbDevice {
    context: Arc<LibusbContext>,
    device: DevPtr,
    handle: HandleWrapper,
    descriptor: DeviceDescriptor,
    /// Alt settings we have selected; libusb does not read them back.
    alt_settings: Mutex<HashMap<u8, u8>>,
}

/// How to pick a device off the bus.
#[derive(Clone, Copy, Debug)]
pub enum DeviceSelector {
    VendorProduct(u16, u16),
    BusAddress(u8, u8),
}

impl LibusbDevice {
    /// Walk the device list and open the first match.
    pub fn open(
        context: &Arc<LibusbContext>,
        selector: DeviceSelector,
    ) -> io::Result<Arc<LibusbDevice>> {
        let mut list = ptr::null();
        let count = unsafe { libusb::libusb_get_device_list(context.ptr.0, &mut list) };
        if count < 0 {
            return Err(usb_error(count as i32));
        }

        let mut found = None;
        for i in 0..count {
            let device = unsafe { *list.add(i as usize) };
            let Some(desc) = read_descriptor(device) else {
                continue;
            };
            let matches = match selector {
                DeviceSelector::VendorProduct(vid, pid) => {
                    desc.idVendor == vid && desc.idProduct == pid
                }
                DeviceSelector::BusAddress(bus, addr) => unsafe {
                    libusb::libusb_get_bus_number(device) == bus
                        && libusb::libusb_get_device_address(device) == addr
                },
            };
            if matches {
                found = Some((device, desc));
                break;
            }
        }

        let result = match found {
            Some((device, desc)) => {
                let mut handle = ptr::null_mut();
                let rc = unsafe { libusb::libusb_open(device, &mut handle) };
                if rc < 0 {
                    Err(usb_error(rc))
                } else {
                    unsafe { libusb::libusb_ref_device(device) };
                    let speed = match unsafe { libusb::libusb_get_device_speed(device) } {
                        LIBUSB_SPEED_LOW => DeviceSpeed::Low,
                        LIBUSB_SPEED_FULL => DeviceSpeed::Full,
                        LIBUSB_SPEED_HIGH => DeviceSpeed::High,
                        LIBUSB_SPEED_SUPER => DeviceSpeed::Super,
                        _ => DeviceSpeed::Unknown,
                    };
                    Ok(Arc::new(LibusbDevice {
                        context: context.clone(),
                        device: DevPtr(device),
                        handle: HandleWrapper(handle),
                        descriptor: DeviceDescriptor {
                            speed,
                            class: desc.bDeviceClass,
                            subclass: desc.bDeviceSubClass,
                            protocol: desc.bDeviceProtocol,
                            vendor_id: desc.idVendor,
                            product_id: desc.idProduct,
                            version_bcd: desc.bcdDevice,
                        },
                        alt_settings: Mutex::new(HashMap::new()),
                    }))
                }
            }
            None => Err(io::Error::new(
                io::ErrorKind::NotFound,
                format!("no usb device matched {selector:?}"),
            )),
        };

        unsafe { libusb::libusb_free_device_list(list, 1) };
        result
    }

    /// Product string for log output, falling back to the numeric ids.
    pub fn label(&self) -> String {
        let mut buf = vec![0u8; 255];
        if let Some(desc) = read_descriptor(self.device.0) {
            if desc.iProduct != 0 {
                let len = unsafe {
                    libusb::libusb_get_string_descriptor_ascii(
                        self.handle.0,
                        desc.iProduct,
                        buf.as_mut_ptr(),
                        buf.len() as c_int,
                    )
                };
                if len > 0 {
                    buf.truncate(len as usize);
                    if let Ok(s) = String::from_utf8(buf) {
                        return s;
                    }
                }
            }
        }
        format!(
            "{:04x}:{:04x}",
            self.descriptor.vendor_id, self.descriptor.product_id
        )
    }

    fn max_streams_for(&self, endpoint: *const libusb::libusb_endpoint_descriptor) -> u32 {
        let mut comp = ptr::null();
        let rc = unsafe {
            libusb::libusb_get_ss_endpoint_companion_descriptor(
                self.context.ptr.0,
                endpoint,
                &mut comp,
            )
        };
        if rc < 0 || comp.is_null() {
            return 0;
        }
        let bits = unsafe { (*comp).bmAttributes } & 0x1f;
        unsafe { libusb::libusb_free_ss_endpoint_companion_descriptor(comp as *mut _) };
        if bits == 0 { 0 } else { 1 << bits }
    }
}

struct ConfigPtr(*const libusb::libusb_config_descriptor);

impl Drop for ConfigPtr {
    fn drop(&mut self) {
        unsafe { libusb::libusb_free_config_descriptor(self.0) };
    }
}

impl UsbDevice for LibusbDevice {
    fn descriptor(&self) -> DeviceDescriptor {
        self.descriptor
    }

    fn active_config(&self) -> io::Result<ConfigDescriptor> {
        let mut raw = ptr::null();
        let rc = unsafe { libusb::libusb_get_active_config_descriptor(self.device.0, &mut raw) };
        if rc < 0 {
            return Err(usb_error(rc));
        }
        let config = ConfigPtr(raw);
        let alts = self.alt_settings.lock().unwrap();

        let mut out = ConfigDescriptor {
            value: unsafe { (*config.0).bConfigurationValue },
            interfaces: Vec::new(),
        };
        let iface_count = unsafe { (*config.0).bNumInterfaces };
        for i in 0..iface_count {
            let interface = unsafe { &*(*config.0).interface.add(i as usize) };
            if interface.num_altsetting <= 0 {
                continue;
            }
            // Pick the alt setting we last selected, 0 otherwise.
            let first = unsafe { &*interface.altsetting };
            let wanted = alts.get(&first.bInterfaceNumber).copied().unwrap_or(0);
            let mut chosen = first;
            for a in 0..interface.num_altsetting as usize {
                let alt = unsafe { &*interface.altsetting.add(a) };
                if alt.bAlternateSetting == wanted {
                    chosen = alt;
                    break;
                }
            }

            let mut endpoints = Vec::new();
            for e in 0..chosen.bNumEndpoints as usize {
                let ep = unsafe { chosen.endpoint.add(e) };
                let epref = unsafe { &*ep };
                endpoints.push(EndpointDescriptor {
                    address: epref.bEndpointAddress,
                    attributes: epref.bmAttributes,
                    max_packet_size: epref.wMaxPacketSize,
                    interval: epref.bInterval,
                    max_streams: self.max_streams_for(ep),
                });
            }
            out.interfaces.push(InterfaceDescriptor {
                number: chosen.bInterfaceNumber,
                alt_setting: chosen.bAlternateSetting,
                class: chosen.bInterfaceClass,
                subclass: chosen.bInterfaceSubClass,
                protocol: chosen.bInterfaceProtocol,
                endpoints,
            });
        }
        Ok(out)
    }

    fn set_auto_detach_kernel_driver(&self, enable: bool) {
        let flag = if enable { 1 } else { 0 };
        let rc = unsafe { libusb::libusb_set_auto_detach_kernel_driver(self.handle.0, flag) };
        if rc < 0 && rc != LIBUSB_ERROR_NOT_SUPPORTED {
            log::warn!("auto detach kernel driver failed: {}", usb_error(rc));
        }
    }

    fn claim_interface(&self, number: u8) -> io::Result<()> {
        let rc = unsafe { libusb::libusb_claim_interface(self.handle.0, number as c_int) };
        if rc < 0 {
            return Err(usb_error(rc));
        }
        Ok(())
    }

    fn release_interface(&self, number: u8) -> io::Result<()> {
        let rc = unsafe { libusb::libusb_release_interface(self.handle.0, number as c_int) };
        if rc < 0 {
            return Err(usb_error(rc));
        }
        Ok(())
    }

    fn set_configuration(&self, value: u8) -> io::Result<()> {
        let rc = unsafe { libusb::libusb_set_configuration(self.handle.0, value as c_int) };
        if rc < 0 {
            return Err(usb_error(rc));
        }
        self.alt_settings.lock().unwrap().clear();
        Ok(())
    }

    fn set_alt_setting(&self, interface: u8, alt: u8) -> io::Result<()> {
        let rc = unsafe {
            libusb::libusb_set_interface_alt_setting(
                self.handle.0,
                interface as c_int,
                alt as c_int,
            )
        };
        if rc < 0 {
            return Err(usb_error(rc));
        }
        self.alt_settings.lock().unwrap().insert(interface, alt);
        Ok(())
    }

    fn reset(&self) -> io::Result<()> {
        let rc = unsafe { libusb::libusb_reset_device(self.handle.0) };
        if rc < 0 {
            return Err(usb_error(rc));
        }
        self.alt_settings.lock().unwrap().clear();
        Ok(())
    }

    fn clear_halt(&self, endpoint: u8) -> io::Result<()> {
        let rc = unsafe { libusb::libusb_clear_halt(self.handle.0, endpoint) };
        if rc < 0 {
            return Err(usb_error(rc));
        }
        Ok(())
    }

    fn alloc_streams(&self, endpoints: &[u8], count: u32) -> io::Result<u32> {
        let rc = unsafe {
            libusb::libusb_alloc_streams(
                self.handle.0,
                count,
                endpoints.as_ptr() as *mut u8,
                endpoints.len() as c_int,
            )
        };
        if rc < 0 {
            return Err(usb_error(rc));
        }
        Ok(rc as u32)
    }

    fn free_streams(&self, endpoints: &[u8]) -> io::Result<()> {
        let rc = unsafe {
            libusb::libusb_free_streams(
                self.handle.0,
                endpoints.as_ptr() as *mut u8,
                endpoints.len() as c_int,
            )
        };
        if rc < 0 {
            return Err(usb_error(rc));
        }
        Ok(())
    }

    fn submit(
        &self,
        request: TransferRequest,
        completion: CompletionFn,
    ) -> io::Result<TransferHandle> {
        let iso_packets = match &request {
            TransferRequest::Iso { num_packets, .. } => *num_packets,
            _ => 0,
        };
        let transfer = unsafe { libusb::libusb_alloc_transfer(iso_packets as c_int) };
        if transfer.is_null() {
            return Err(io::Error::new(
                io::ErrorKind::Other,
                "failed to allocate libusb transfer",
            ));
        }

        let state = Box::new(CallbackState::new(request, completion));
        let state_ptr = Box::into_raw(state);

        unsafe {
            let state = &mut *state_ptr;
            let t = &mut *transfer;
            t.dev_handle = self.handle.0;
            t.callback = transfer_callback;
            t.user_data = state_ptr as *mut c_void;
            t.buffer = state.buffer.as_mut_ptr();
            t.length = state.buffer.len() as c_int;
            t.timeout = 0;

            match &state.request {
                TransferRequest::Control { timeout, .. } => {
                    t.endpoint = 0;
                    t.transfer_type = LIBUSB_TRANSFER_TYPE_CONTROL;
                    t.timeout = timeout_ms(*timeout);
                }
                TransferRequest::Bulk {
                    endpoint,
                    stream_id,
                    ..
                } => {
                    t.endpoint = *endpoint;
                    if *stream_id != 0 {
                        t.transfer_type = LIBUSB_TRANSFER_TYPE_BULK_STREAM;
                        libusb::libusb_transfer_set_stream_id(transfer, *stream_id);
                    } else {
                        t.transfer_type = LIBUSB_TRANSFER_TYPE_BULK;
                    }
                }
                TransferRequest::Interrupt { endpoint, .. } => {
                    t.endpoint = *endpoint;
                    t.transfer_type = LIBUSB_TRANSFER_TYPE_INTERRUPT;
                }
                TransferRequest::Iso {
                    endpoint,
                    num_packets,
                    lengths,
                    ..
                } => {
                    t.endpoint = *endpoint;
                    t.transfer_type = LIBUSB_TRANSFER_TYPE_ISOCHRONOUS;
                    t.num_iso_packets = *num_packets as c_int;
                    let descs = std::slice::from_raw_parts_mut(
                        t.iso_packet_desc.as_mut_ptr(),
                        *num_packets,
                    );
                    for (desc, len) in descs.iter_mut().zip(lengths.iter()) {
                        desc.length = *len as c_uint;
                    }
                }
            }
        }

        let rc = unsafe { libusb::libusb_submit_transfer(transfer) };
        if rc < 0 {
            unsafe {
                drop(Box::from_raw(state_ptr));
                libusb::libusb_free_transfer(transfer);
            }
            return Err(usb_error(rc));
        }
        Ok(TransferHandle(transfer as usize))
    }

    fn cancel(&self, handle: TransferHandle) -> io::Result<()> {
        let rc =
            unsafe { libusb::libusb_cancel_transfer(handle.0 as *mut libusb::libusb_transfer) };
        if rc < 0 {
            return Err(usb_error(rc));
        }
        Ok(())
    }

    fn poll_completions(&self, timeout: Duration) {
        // The context's event thread is free running; waiting is enough.
        std::thread::sleep(timeout);
    }
}

struct CallbackState {
    request: TransferRequest,
    completion: Option<CompletionFn>,
    buffer: Vec<u8>,
}

impl CallbackState {
    fn new(request: TransferRequest, completion: CompletionFn) -> CallbackState {
        let buffer = match &request {
            TransferRequest::Control {
                request: breq,
                requesttype,
                value,
                index,
                length,
                data,
                ..
            } => {
                let mut buf = vec![0u8; LIBUSB_CONTROL_SETUP_SIZE + *length as usize];
                unsafe {
                    libusb::libusb_fill_control_setup(
                        buf.as_mut_ptr(),
                        *requesttype,
                        *breq,
                        *value,
                        *index,
                        *length,
                    );
                }
                if !data.is_empty() {
                    buf[LIBUSB_CONTROL_SETUP_SIZE..LIBUSB_CONTROL_SETUP_SIZE + data.len()]
                        .copy_from_slice(data);
                }
                buf
            }
            TransferRequest::Bulk { length, data, .. }
            | TransferRequest::Interrupt { length, data, .. } => {
                if data.is_empty() {
                    vec![0u8; *length]
                } else {
                    data.clone()
                }
            }
            TransferRequest::Iso {
                num_packets,
                packet_len,
                data,
                ..
            } => {
                if data.is_empty() {
                    vec![0u8; num_packets * packet_len]
                } else {
                    data.clone()
                }
            }
        };
        CallbackState {
            request,
            completion: Some(completion),
            buffer,
        }
    }
}

extern "system" fn transfer_callback(transfer: *mut libusb::libusb_transfer) {
    unsafe {
        let state_ptr = (*transfer).user_data as *mut CallbackState;
        let mut state = Box::from_raw(state_ptr);

        let status = map_transfer_status((*transfer).status);
        let actual = (*transfer).actual_length as usize;

        let mut iso_packets = Vec::new();
        let mut data = Vec::new();
        match &state.request {
            TransferRequest::Control { data: out, .. } => {
                if out.is_empty() && actual > 0 {
                    data = state.buffer
                        [LIBUSB_CONTROL_SETUP_SIZE..LIBUSB_CONTROL_SETUP_SIZE + actual]
                        .to_vec();
                }
            }
            TransferRequest::Bulk { data: out, .. }
            | TransferRequest::Interrupt { data: out, .. } => {
                if out.is_empty() {
                    state.buffer.truncate(actual);
                    data = std::mem::take(&mut state.buffer);
                }
            }
            TransferRequest::Iso {
                num_packets,
                data: out,
                ..
            } => {
                let descs =
                    std::slice::from_raw_parts((*transfer).iso_packet_desc.as_ptr(), *num_packets);
                for desc in descs {
                    iso_packets.push(IsoPacketResult {
                        status: map_transfer_status(desc.status),
                        actual: desc.actual_length as usize,
                    });
                }
                if out.is_empty() {
                    data = std::mem::take(&mut state.buffer);
                }
            }
        }

        let result = TransferResult {
            status,
            actual,
            data,
            iso_packets,
        };
        if let Some(completion) = state.completion.take() {
            completion(result);
        }
        // The handle stays valid until the completion above has returned.
        libusb::libusb_free_transfer(transfer);
    }
}

/// Millisecond timeout for a libusb transfer; 0 disables the timeout and
/// sub-millisecond waits round up so they stay finite.
fn timeout_ms(timeout: Duration) -> c_uint {
    match timeout.as_millis() {
        0 if timeout.is_zero() => 0,
        0 => 1,
        ms => ms.min(c_uint::MAX as u128) as c_uint,
    }
}

fn read_descriptor(
    device: *mut libusb::libusb_device,
) -> Option<libusb::libusb_device_descriptor> {
    let mut desc = MaybeUninit::<libusb::libusb_device_descriptor>::uninit();
    let rc = unsafe { libusb::libusb_get_device_descriptor(device, desc.as_mut_ptr()) };
    (rc >= 0).then(|| unsafe { desc.assume_init() })
}

/// Turn a negative libusb return code into an `io::Error` carrying the
/// symbolic libusb name.
fn usb_error(rc: i32) -> io::Error {
    let kind = match rc {
        LIBUSB_ERROR_NO_DEVICE => io::ErrorKind::NotConnected,
        LIBUSB_ERROR_NOT_FOUND => io::ErrorKind::NotFound,
        LIBUSB_ERROR_ACCESS => io::ErrorKind::PermissionDenied,
        LIBUSB_ERROR_TIMEOUT => io::ErrorKind::WouldBlock,
        LIBUSB_ERROR_INTERRUPTED => io::ErrorKind::Interrupted,
        LIBUSB_ERROR_PIPE => io::ErrorKind::BrokenPipe,
        _ => io::ErrorKind::Other,
    };
    let name = unsafe {
        let s = libusb::libusb_error_name(rc);
        if s.is_null() {
            None
        } else {
            Some(CStr::from_ptr(s).to_string_lossy().into_owned())
        }
    };
    match name {
        Some(name) => io::Error::new(kind, format!("{name} ({rc})")),
        None => io::Error::new(kind, format!("libusb error {rc}")),
    }
}

fn map_transfer_status(status: i32) -> TransferStatus {
    match status {
        LIBUSB_TRANSFER_COMPLETED => TransferStatus::Completed,
        LIBUSB_TRANSFER_TIMED_OUT => TransferStatus::TimedOut,
        LIBUSB_TRANSFER_CANCELLED => TransferStatus::Cancelled,
        LIBUSB_TRANSFER_STALL => TransferStatus::Stall,
        LIBUSB_TRANSFER_NO_DEVICE => TransferStatus::NoDevice,
        LIBUSB_TRANSFER_OVERFLOW => TransferStatus::Overflow,
        _ => TransferStatus::Error,
    }
}
