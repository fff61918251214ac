/// Non-success status codes reported by an encode device.
///
/// The discriminants follow the NVENC API so a device backed by the real driver can convert its
/// `NVENCSTATUS` with [`DeviceStatus::from_code`].
#[repr(i32)]
#[derive(thiserror::Error, Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DeviceStatus {
    #[error("No encode capable devices were detected")]
    NoEncodeDevice = 1,
    #[error("The device passed by the client is not supported")]
    UnsupportedDevice = 2,
    #[error("The encoder device supplied by the client is not valid")]
    InvalidEncoderDevice = 3,
    #[error("The device passed to the API call is invalid")]
    InvalidDevice = 4,
    #[error("The device is no longer available and the session must be recreated")]
    DeviceNotExist = 5,
    #[error("One or more of the pointers passed to the API call is invalid")]
    InvalidPtr = 6,
    #[error("The completion event passed to the encode call is invalid")]
    InvalidEvent = 7,
    #[error("One or more of the parameters passed to the API call is invalid")]
    InvalidParam = 8,
    #[error("An API call was made in wrong sequence/order")]
    InvalidCall = 9,
    #[error("Unable to allocate enough memory to perform the requested operation")]
    OutOfMemory = 10,
    #[error("The encoder has not been initialized")]
    EncoderNotInitialized = 11,
    #[error("An unsupported parameter was passed by the client")]
    UnsupportedParam = 12,
    #[error("The output buffer is busy and could not be locked")]
    LockBusy = 13,
    #[error("The user buffer is too small for the requested operation")]
    NotEnoughBuffer = 14,
    #[error("An invalid struct version was used by the client")]
    InvalidVersion = 15,
    #[error("Mapping the input resource failed")]
    MapFailed = 16,
    /// Not an error for an encode call: the device holds the frame for reordering and the output
    /// becomes available after more input.
    #[error("The encoder requires more input before producing output")]
    NeedMoreInput = 17,
    #[error("The hardware encoder is busy")]
    EncoderBusy = 18,
    #[error("The completion event has not been registered with the encoder")]
    EventNotRegistered = 19,
    #[error("An unknown internal error has occurred")]
    Generic = 20,
    #[error("The feature is not available for the license type of this system")]
    IncompatibleClientKey = 21,
    #[error("The feature is not implemented for the current version")]
    Unimplemented = 22,
    #[error("Registering the resource failed")]
    ResourceRegisterFailed = 23,
    #[error("The resource has not been registered")]
    ResourceNotRegistered = 24,
    #[error("The resource has not been mapped")]
    ResourceNotMapped = 25,

    // Graphics context errors, outside of the encode API range
    #[error("The graphics context reported an error")]
    Graphics = GRAPHICS_ERRORS_OFFSET,
}

const GRAPHICS_ERRORS_OFFSET: i32 = 100;

impl DeviceStatus {
    /// Converts a raw status code. Returns `None` for success (`0`) and for unknown codes.
    pub fn from_code(code: i32) -> Option<Self> {
        use DeviceStatus::*;

        const ALL: [DeviceStatus; 26] = [
            NoEncodeDevice,
            UnsupportedDevice,
            InvalidEncoderDevice,
            InvalidDevice,
            DeviceNotExist,
            InvalidPtr,
            InvalidEvent,
            InvalidParam,
            InvalidCall,
            OutOfMemory,
            EncoderNotInitialized,
            UnsupportedParam,
            LockBusy,
            NotEnoughBuffer,
            InvalidVersion,
            MapFailed,
            NeedMoreInput,
            EncoderBusy,
            EventNotRegistered,
            Generic,
            IncompatibleClientKey,
            Unimplemented,
            ResourceRegisterFailed,
            ResourceNotRegistered,
            ResourceNotMapped,
            Graphics,
        ];

        ALL.into_iter().find(|status| status.code() == code)
    }

    #[inline]
    pub fn code(self) -> i32 {
        self as i32
    }
}
