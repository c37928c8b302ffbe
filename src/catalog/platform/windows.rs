use tracing::{debug, warn};
use windows::Win32::Media::DirectShow::ICreateDevEnum;
use windows::Win32::Media::MediaFoundation::{
    CLSID_SystemDeviceEnum, CLSID_VideoInputDeviceCategory,
};
use windows::Win32::System::Com::StructuredStorage::IPropertyBag;
use windows::Win32::System::Com::{
    CoCreateInstance, CoInitializeEx, CoUninitialize, IMoniker, CLSCTX_INPROC_SERVER,
    COINIT_MULTITHREADED,
};
use windows::Win32::System::Variant::VARIANT;

use crate::catalog::enumerator::DeviceEnumerator;
use crate::catalog::types::{DeviceDescriptor, DeviceId};
use crate::error::{CaptureError, Result};

/// DirectShow enumerator over the video-input device category.
pub struct DirectShowEnumerator;

impl DirectShowEnumerator {
    pub fn new() -> Self {
        Self
    }
}

impl Default for DirectShowEnumerator {
    fn default() -> Self {
        Self::new()
    }
}

impl DeviceEnumerator for DirectShowEnumerator {
    fn enumerate(&self) -> Result<Vec<DeviceDescriptor>> {
        unsafe { enumerate_video_input_devices() }
    }
}

/// Walk the `CLSID_VideoInputDeviceCategory` moniker enumerator.
///
/// # Safety
/// Calls COM APIs. Initialises COM (MTA) via a scoped guard.
unsafe fn enumerate_video_input_devices() -> Result<Vec<DeviceDescriptor>> {
    let _guard = ComGuard::init().map_err(CaptureError::Enumeration)?;

    let dev_enum: ICreateDevEnum =
        CoCreateInstance(&CLSID_SystemDeviceEnum, None, CLSCTX_INPROC_SERVER).map_err(|e| {
            CaptureError::Enumeration(format!("CoCreateInstance(SystemDeviceEnum) failed: {e}"))
        })?;

    let mut enum_moniker = None;
    dev_enum
        .CreateClassEnumerator(&CLSID_VideoInputDeviceCategory, &mut enum_moniker, 0)
        .map_err(|e| CaptureError::Enumeration(format!("CreateClassEnumerator failed: {e}")))?;

    // No enumerator at all means the category is empty, not broken.
    let Some(enum_moniker) = enum_moniker else {
        return Ok(vec![]);
    };

    let mut devices = Vec::new();
    let mut moniker_array = [None; 1];

    loop {
        let hr = enum_moniker.Next(&mut moniker_array, None);
        if hr.is_err() {
            break;
        }

        let Some(moniker) = moniker_array[0].take() else {
            break;
        };

        let bag: IPropertyBag = match moniker.BindToStorage(
            None::<&windows::Win32::System::Com::IBindCtx>,
            None::<&IMoniker>,
        ) {
            Ok(b) => b,
            Err(e) => {
                warn!("BindToStorage failed for a device, skipping: {e}");
                continue;
            }
        };

        let name = read_property_string(&bag, "FriendlyName")
            .unwrap_or_else(|| "Unknown Camera".to_string());
        let device_path = read_property_string(&bag, "DevicePath").unwrap_or_default();

        debug!("discovered device: name={name}, path={device_path}");

        let id = if device_path.is_empty() {
            DeviceId::from_name(&name)
        } else {
            DeviceId::new(device_path)
        };

        devices.push(DeviceDescriptor { id, name });
    }

    Ok(devices)
}

/// Read a string property from an `IPropertyBag`.
unsafe fn read_property_string(bag: &IPropertyBag, name: &str) -> Option<String> {
    use windows::core::BSTR;

    let prop_name = BSTR::from(name);
    let mut variant = VARIANT::default();

    bag.Read(
        windows::core::PCWSTR(prop_name.as_ptr()),
        &mut variant,
        None,
    )
    .ok()?;

    // Extract the BSTR value from the VARIANT union.
    // VARIANT layout: Anonymous.Anonymous.Anonymous.bstrVal
    let bstr_ptr: *const *const u16 = std::ptr::addr_of!(variant)
        .cast::<u8>()
        .add(8) // offset to the union data in VARIANT
        .cast();
    let raw_bstr = *bstr_ptr;
    if raw_bstr.is_null() {
        return None;
    }

    // BSTR length prefix sits in the 4 bytes before the pointer.
    let len_ptr = (raw_bstr as *const u8).sub(4) as *const u32;
    let byte_len = *len_ptr;
    let char_len = byte_len as usize / 2;

    let slice = std::slice::from_raw_parts(raw_bstr, char_len);
    Some(String::from_utf16_lossy(slice))
}

/// COM thread guard — pairs CoInitializeEx with CoUninitialize.
///
/// Callers map the failure string into their own error kind.
pub(crate) struct ComGuard;

impl ComGuard {
    pub(crate) fn init() -> std::result::Result<Self, String> {
        unsafe {
            let hr = CoInitializeEx(None, COINIT_MULTITHREADED);
            if hr.is_err() {
                return Err(format!("CoInitializeEx failed: {hr:?}"));
            }
        }
        Ok(Self)
    }
}

impl Drop for ComGuard {
    fn drop(&mut self) {
        unsafe {
            CoUninitialize();
        }
    }
}
