use std::fmt;

/// Message types of the controller protocol. The codes are fixed by the peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum Signal {
    Terminate = 0,
    Status = 1,
    AddData = 2,
    StartProcess = 3,
    Log = 4,
    RemoveData = 5,
    ProcessFinished = 6,
    UpdateService = 7,
    ValidateProcess = 8,
}

impl Signal {
    pub fn code(self) -> u32 {
        self as u32
    }

    pub fn name(self) -> &'static str {
        match self {
            Signal::Terminate => "TERMINATE_SERVICE",
            Signal::Status => "STATUS",
            Signal::AddData => "ADD_DATA",
            Signal::StartProcess => "START_PROCESS",
            Signal::Log => "LOG",
            Signal::RemoveData => "REMOVE_DATA",
            Signal::ProcessFinished => "PROCESS_FINISHED",
            Signal::UpdateService => "UPDATE_SERVICE",
            Signal::ValidateProcess => "VALIDATE_PROCESS",
        }
    }
}

impl TryFrom<u32> for Signal {
    type Error = u32;

    fn try_from(code: u32) -> Result<Self, Self::Error> {
        match code {
            0 => Ok(Signal::Terminate),
            1 => Ok(Signal::Status),
            2 => Ok(Signal::AddData),
            3 => Ok(Signal::StartProcess),
            4 => Ok(Signal::Log),
            5 => Ok(Signal::RemoveData),
            6 => Ok(Signal::ProcessFinished),
            7 => Ok(Signal::UpdateService),
            8 => Ok(Signal::ValidateProcess),
            other => Err(other),
        }
    }
}

impl fmt::Display for Signal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}({})", self.name(), self.code())
    }
}
