//! Utilities to read the list of known DLLs of the running Windows installation

extern crate ntapi;
extern crate winapi;

use crate::common::LookupError;
use ntapi::ntobapi::{
    NtClose, NtOpenDirectoryObject, NtQueryDirectoryObject, DIRECTORY_QUERY,
    OBJECT_DIRECTORY_INFORMATION,
};
use ntapi::ntrtl::RtlNtStatusToDosError;
use std::ffi::OsString;
use std::mem::size_of;
use std::os::windows::prelude::*;
use std::ptr::null_mut;
use tracing::debug;
use winapi::shared::ntdef::{
    BOOLEAN, FALSE, HANDLE, NTSTATUS, NT_SUCCESS, OBJECT_ATTRIBUTES, TRUE, ULONG,
    UNICODE_STRING, USHORT,
};
use winapi::shared::ntstatus;

unsafe fn unicode_string_to_string(s: &UNICODE_STRING) -> String {
    if s.Buffer.is_null() {
        return String::new();
    }
    let slice = std::slice::from_raw_parts(s.Buffer, s.Length as usize / size_of::<u16>());
    OsString::from_wide(slice).to_string_lossy().into_owned()
}

fn status_to_error(status: NTSTATUS, what: &str) -> LookupError {
    let os_error = unsafe { RtlNtStatusToDosError(status) } as i32;
    LookupError::ContextDeductionError(format!(
        "{}: {}",
        what,
        std::io::Error::from_raw_os_error(os_error)
    ))
}

// in contrast to reading the KnownDLLs registry key, listing the object directory gives us the
// entire list, dependencies of the listed DLLs included
// https://lucasg.github.io/2017/06/07/listing-known-dlls/

/// Returns the complete list of KnownDlls (`\KnownDlls32` for WoW64 processes)
///
/// These DLLs are mapped into each process' memory as copy-on-write. They are all located in
/// the system directory and can't be overridden.
pub fn get_known_dlls(wow64: bool) -> Result<Vec<String>, LookupError> {
    let directory_name = if wow64 { r"\KnownDlls32" } else { r"\KnownDlls" };
    let mut name_buffer: Vec<u16> = directory_name.encode_utf16().collect();
    let mut name = UNICODE_STRING {
        Length: (name_buffer.len() * size_of::<u16>()) as USHORT,
        MaximumLength: (name_buffer.len() * size_of::<u16>()) as USHORT,
        Buffer: name_buffer.as_mut_ptr(),
    };
    let mut oa = OBJECT_ATTRIBUTES {
        Length: size_of::<OBJECT_ATTRIBUTES>() as ULONG,
        RootDirectory: null_mut(),
        ObjectName: &mut name,
        Attributes: 0,
        SecurityDescriptor: null_mut(),
        SecurityQualityOfService: null_mut(),
    };

    let mut handle: HANDLE = null_mut();
    let status = unsafe { NtOpenDirectoryObject(&mut handle, DIRECTORY_QUERY, &mut oa) };
    if !NT_SUCCESS(status) {
        return Err(status_to_error(
            status,
            &format!("could not open {}", directory_name),
        ));
    }

    let result = unsafe { list_sections(handle) };
    unsafe { NtClose(handle) };
    let known_dlls = result?;
    debug!(directory = directory_name, count = known_dlls.len(), "known DLLs listed");
    Ok(known_dlls)
}

unsafe fn list_sections(handle: HANDLE) -> Result<Vec<String>, LookupError> {
    let mut ret = Vec::new();
    let mut first_time: BOOLEAN = TRUE;
    let mut context: ULONG = 0;
    let mut buffer_size: ULONG = 0x200;
    let mut buffer: Vec<u8> = vec![0; buffer_size as usize];

    loop {
        let mut return_length: ULONG = 0;
        let status = loop {
            let status = NtQueryDirectoryObject(
                handle,
                buffer.as_mut_ptr() as *mut winapi::ctypes::c_void,
                buffer_size,
                FALSE,
                first_time,
                &mut context,
                &mut return_length,
            );
            let first = buffer.as_ptr() as *const OBJECT_DIRECTORY_INFORMATION;
            // not even one entry fits: grow the buffer and retry
            if status == ntstatus::STATUS_MORE_ENTRIES && (*first).Name.Buffer.is_null() {
                buffer_size *= 2;
                buffer = vec![0; buffer_size as usize];
                continue;
            }
            break status;
        };
        if !NT_SUCCESS(status) && status != ntstatus::STATUS_NO_MORE_ENTRIES {
            return Err(status_to_error(status, "could not query the KnownDlls directory"));
        }

        let entries = buffer.as_ptr() as *const OBJECT_DIRECTORY_INFORMATION;
        let mut i = 0;
        loop {
            let info = &*entries.add(i);
            if info.Name.Buffer.is_null() {
                break;
            }
            if unicode_string_to_string(&info.TypeName) == "Section" {
                ret.push(unicode_string_to_string(&info.Name));
            }
            i += 1;
        }

        if status != ntstatus::STATUS_MORE_ENTRIES {
            break;
        }
        first_time = FALSE;
        buffer.iter_mut().for_each(|b| *b = 0);
    }

    Ok(ret)
}
