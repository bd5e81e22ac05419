use candle_core::{DType, Device};
use healthgpt_lora::ModuleKind;

/// Where the backbone weights ended up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlacementState {
    Unplaced,
    PlacedDirect,
    PlacedViaHostFallback,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlacementEvent {
    /// The direct load onto the device succeeded.
    DirectLoaded,
    /// The direct load was rejected as unsupported for this device and dtype.
    DirectRejected,
    /// Host load and per-tensor transfer completed.
    HostMoved,
    /// Any other failure.
    Errored,
}

/// What the loader should do after an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlacementAction {
    LoadOnHost,
    Done,
    Abort,
}

/// Tracks one placement attempt. The host fallback is taken at most once and never for
/// quantized loads.
#[derive(Debug, Clone)]
pub struct PlacementMachine {
    state: PlacementState,
    quantized: bool,
    fallback_taken: bool,
}

impl PlacementMachine {
    pub fn new(quantized: bool) -> Self {
        Self {
            state: PlacementState::Unplaced,
            quantized,
            fallback_taken: false,
        }
    }

    pub fn state(&self) -> PlacementState {
        self.state
    }

    pub fn fallback_taken(&self) -> bool {
        self.fallback_taken
    }

    pub fn transition(&mut self, event: PlacementEvent) -> PlacementAction {
        use PlacementEvent::*;
        use PlacementState::*;
        let (state, action) = match (self.state, event) {
            (Unplaced, DirectLoaded) if !self.fallback_taken => (PlacedDirect, PlacementAction::Done),
            (Unplaced, DirectRejected) if !self.quantized && !self.fallback_taken => {
                self.fallback_taken = true;
                (Unplaced, PlacementAction::LoadOnHost)
            }
            (Unplaced, HostMoved) if self.fallback_taken => {
                (PlacedViaHostFallback, PlacementAction::Done)
            }
            _ => (Failed, PlacementAction::Abort),
        };
        self.state = state;
        action
    }
}

/// Location and representation of one leaf of the assembled model.
#[derive(Debug, Clone)]
pub struct LeafPlacement {
    pub name: String,
    pub kind: ModuleKind,
    pub device: Device,
    pub dtype: DType,
    pub quantized: bool,
}

impl LeafPlacement {
    pub fn is_on(&self, device: &Device) -> bool {
        self.device.same_device(device)
    }
}
