//! Windows plumbing: console control events and process-tree
//! termination.
//!
//! Children are spawned with `CREATE_NEW_PROCESS_GROUP`, so a
//! CTRL_BREAK event reaches the whole group. Hard kills terminate the
//! process tree via a job object, falling back to Toolhelp snapshot
//! enumeration when the process already belongs to another job (common
//! under CI).

use tracing::debug;
use windows::Win32::Foundation::{CloseHandle, ERROR_INVALID_PARAMETER, HANDLE};
use windows::Win32::System::Console::{CTRL_BREAK_EVENT, GenerateConsoleCtrlEvent};
use windows::Win32::System::Diagnostics::ToolHelp::{
    CreateToolhelp32Snapshot, PROCESSENTRY32, Process32First, Process32Next, TH32CS_SNAPPROCESS,
};
use windows::Win32::System::JobObjects::{
    AssignProcessToJobObject, CreateJobObjectW, TerminateJobObject,
};
use windows::Win32::System::Threading::{
    OpenProcess, PROCESS_SET_QUOTA, PROCESS_TERMINATE, TerminateProcess,
};

/// Deliver CTRL_BREAK to the child's process group.
pub(crate) fn send_ctrl_break(pid: u32) {
    // SAFETY: plain win32 call; a failure only means the group is gone
    // or detached from the console.
    if let Err(err) = unsafe { GenerateConsoleCtrlEvent(CTRL_BREAK_EVENT, pid) } {
        debug!(pid, %err, "GenerateConsoleCtrlEvent failed");
    }
}

/// Terminate the process and all of its descendants.
pub(crate) fn terminate_tree(pid: u32) {
    // SAFETY: handle lifetimes are local; every handle opened here is
    // closed before returning.
    unsafe {
        if let Ok(proc_handle) = OpenProcess(PROCESS_TERMINATE | PROCESS_SET_QUOTA, false, pid) {
            if let Ok(job) = CreateJobObjectW(None, None) {
                if AssignProcessToJobObject(job, proc_handle).is_ok()
                    && TerminateJobObject(job, 1).is_ok()
                {
                    let _ = CloseHandle(job);
                    let _ = CloseHandle(proc_handle);
                    return;
                }
                let _ = CloseHandle(job);
            }
            let _ = CloseHandle(proc_handle);
        }
        terminate_by_snapshot(pid);
    }
}

/// Fallback: enumerate the process table and terminate the subtree
/// rooted at `root_pid`, children first.
unsafe fn terminate_by_snapshot(root_pid: u32) {
    let snapshot = match unsafe { CreateToolhelp32Snapshot(TH32CS_SNAPPROCESS, 0) } {
        Ok(s) => s,
        Err(err) => {
            debug!(root_pid, %err, "CreateToolhelp32Snapshot failed");
            return;
        }
    };

    let mut entries: Vec<(u32, u32)> = Vec::new();
    let mut entry = PROCESSENTRY32 {
        dwSize: std::mem::size_of::<PROCESSENTRY32>() as u32,
        ..Default::default()
    };
    if unsafe { Process32First(snapshot, &mut entry) }.is_ok() {
        loop {
            entries.push((entry.th32ProcessID, entry.th32ParentProcessID));
            entry = PROCESSENTRY32 {
                dwSize: std::mem::size_of::<PROCESSENTRY32>() as u32,
                ..Default::default()
            };
            if unsafe { Process32Next(snapshot, &mut entry) }.is_err() {
                break;
            }
        }
    }
    let _ = unsafe { CloseHandle(snapshot) };

    // BFS over parent links to collect the subtree.
    let mut to_kill: Vec<u32> = vec![root_pid];
    let mut i = 0;
    while i < to_kill.len() {
        let parent = to_kill[i];
        for &(child, child_parent) in &entries {
            if child_parent == parent && !to_kill.contains(&child) {
                to_kill.push(child);
            }
        }
        i += 1;
    }

    for &target in to_kill.iter().rev() {
        match unsafe { OpenProcess(PROCESS_TERMINATE, false, target) } {
            Ok(h) => {
                let h: HANDLE = h;
                let _ = unsafe { TerminateProcess(h, 1) };
                let _ = unsafe { CloseHandle(h) };
            }
            Err(err) => {
                // ERROR_INVALID_PARAMETER: the process already exited.
                if err.code() != ERROR_INVALID_PARAMETER.to_hresult() {
                    debug!(target, %err, "OpenProcess failed during tree kill");
                }
            }
        }
    }
}
