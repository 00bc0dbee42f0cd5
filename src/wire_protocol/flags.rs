//! Message flags.
use bitflags::bitflags;

bitflags! {
    /// Represents the bit vector of flags for an OP_MSG message.
    pub struct OpMsgFlags: u32 {
        const CHECKSUM_PRESENT = 0b0000_0001;
        const MORE_TO_COME     = 0b0000_0010;
        const EXHAUST_ALLOWED  = 1 << 16;
    }
}

impl OpMsgFlags {
    /// Bits a peer may set that this crate does not understand make the message unreadable.
    /// Only the lowest 16 bits are required to be understood.
    pub fn has_unknown_required_bits(bits: u32) -> bool {
        let known = (OpMsgFlags::CHECKSUM_PRESENT | OpMsgFlags::MORE_TO_COME).bits();
        bits & 0xFFFF & !known != 0
    }
}
