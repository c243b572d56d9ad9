/*!
    Convenient structures to address the slave's dictionary objects (SDO).

    This module also provides consts for the standard dictionary items this master touches,
    so no object index is hardcoded elsewhere.
*/

use crate::data::{self, PduData};
use bilge::prelude::*;
use core::{fmt, marker::PhantomData};

/// address of an SDO's subitem, not a SDO itself
#[derive(Eq, PartialEq)]
pub struct Sdo<T: PduData = ()> {
    /// index of the item in the slave's dictionary of objects
    pub index: u16,
    /// subindex in the item
    pub sub: u8,
    extracted: PhantomData<T>,
}

impl<T: PduData> Sdo<T> {
    /// address an sdo subitem
    pub const fn sub(index: u16, sub: u8) -> Self {
        Self { index, sub, extracted: PhantomData }
    }
}

impl<T: PduData> fmt::Display for Sdo<T> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{:#x}:{}", self.index, self.sub)
    }
}
impl<T: PduData> fmt::Debug for Sdo<T> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "Sdo{{index: {:#x}, sub: {}}}", self.index, self.sub)
    }
}
// [Clone] and [Copy] must be implemented manually to allow copying a sdo pointing to a type which does not implement this operation
impl<T: PduData> Clone for Sdo<T> {
    fn clone(&self) -> Self {
        *self
    }
}
impl<T: PduData> Copy for Sdo<T> {}

/// SDO behaving like a list: subitem 0 is the length, subitems 1.. are the elements
#[derive(Eq, PartialEq)]
pub struct SdoList<T> {
    /// index of the SDO to be considered as a list
    pub index: u16,
    _data: PhantomData<T>,
}

impl<T: PduData> SdoList<T> {
    pub const fn new(index: u16) -> Self {
        Self { index, _data: PhantomData }
    }
    /// sdo subitem giving the current length of the list
    pub const fn len(&self) -> Sdo<u8> {
        Sdo::sub(self.index, 0)
    }
    /// sdo subitem of a list item, 0-based
    pub fn item(&self, position: u8) -> Sdo<T> {
        assert!(position < u8::MAX, "position exceeds list capacity");
        Sdo::sub(self.index, position + 1)
    }
}

impl<T: PduData> fmt::Debug for SdoList<T> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "SdoList{{index: {:#x}}}", self.index)
    }
}
impl<T> Clone for SdoList<T> {
    fn clone(&self) -> Self {
        Self { index: self.index, _data: PhantomData }
    }
}
impl<T> Copy for SdoList<T> {}

/// one entry of a PDO mapping object, as stored in the subitems of objects 0x1600-0x17ff and 0x1a00-0x1bff
/// ETG.1000.6 table 74
#[bitsize(32)]
#[derive(FromBits, DebugBits, Copy, Clone, Eq, PartialEq)]
pub struct PdoMappingEntry {
    /// size of the mapped value in bits
    pub bit_length: u8,
    /// subindex of the mapped object, 0 for padding entries
    pub sub: u8,
    /// index of the mapped object, 0 for padding entries
    pub index: u16,
}
data::bilge_pdudata!(PdoMappingEntry, u32);

/// the PDO mapping object at the given index, its items being the mapped entries
pub const fn pdo(index: u16) -> SdoList<PdoMappingEntry> {
    SdoList::new(index)
}

/// PDO assignment lists of the sync-manager channels
pub mod sync_manager {
    use super::*;

    /// PDO assignment list of the given sync channel (object 0x1c10 + channel)
    pub const fn assignment(channel: u8) -> SdoList<u16> {
        SdoList::new(0x1c10 + channel as u16)
    }
    /// RxPDO assignment (sync channel 2, outputs of the master)
    pub const rx_pdos: SdoList<u16> = SdoList::new(0x1c12);
    /// TxPDO assignment (sync channel 3, inputs of the master)
    pub const tx_pdos: SdoList<u16> = SdoList::new(0x1c13);
}

/// standard device identity objects
pub mod device {
    use super::*;

    /// device type object
    pub const ty: Sdo<u32> = Sdo::sub(0x1000, 0);
    /// identity object 0x1018
    pub mod identity {
        use super::*;

        pub const vendor: Sdo<u32> = Sdo::sub(0x1018, 1);
        pub const product: Sdo<u32> = Sdo::sub(0x1018, 2);
        pub const revision: Sdo<u32> = Sdo::sub(0x1018, 3);
        pub const serial_number: Sdo<u32> = Sdo::sub(0x1018, 4);
    }
}
