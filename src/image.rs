use std::fmt;
use std::ops::Deref;
use std::sync::atomic::{
    AtomicBool, AtomicI16, AtomicI32, AtomicI64, AtomicI8, AtomicU16, AtomicU32, AtomicU64,
    AtomicU8, Ordering,
};
use std::sync::Arc;

use chrono::{DateTime, Datelike, Timelike, Utc};
use parking_lot::{Mutex, MutexGuard};

use crate::{Error, Result};

/// Slots per image axis: every family/type table is `IMAGE_DIM` × `IMAGE_DIM`
pub const IMAGE_DIM: usize = 100;

/// I/O variable direction
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Family {
    /// Variables written by hardware/peers, read by the program
    Input,
    /// Variables written by the program, pushed to hardware/peers
    Output,
}

mod sealed {
    pub trait Sealed {}
}

/// The IEC 61131-3 elementary types a cell may hold: BOOL, SINT/INT/DINT/LINT,
/// USINT/UINT/UDINT/ULINT, REAL, LREAL.
///
/// The trait is sealed; the implementations map each type onto its atomic
/// storage so that cells stay `Sync` while the image lock provides the actual
/// access ordering.
pub trait IecType: sealed::Sealed + Copy + Default + Send + Sync + 'static {
    #[doc(hidden)]
    type Repr: Default + Send + Sync;
    #[doc(hidden)]
    fn load(repr: &Self::Repr) -> Self;
    #[doc(hidden)]
    fn store(repr: &Self::Repr, value: Self);
    #[doc(hidden)]
    fn tables(image: &ProcessImage) -> &TablePair<Self>;
    #[doc(hidden)]
    fn tables_mut(image: &mut ProcessImage) -> &mut TablePair<Self>;
}

// Relaxed suffices everywhere below: the image lock orders all cell access.
macro_rules! impl_iec {
    ($t: ty, $atomic: ty, $field: ident) => {
        impl sealed::Sealed for $t {}
        impl IecType for $t {
            type Repr = $atomic;
            fn load(repr: &Self::Repr) -> Self {
                repr.load(Ordering::Relaxed)
            }
            fn store(repr: &Self::Repr, value: Self) {
                repr.store(value, Ordering::Relaxed);
            }
            fn tables(image: &ProcessImage) -> &TablePair<Self> {
                &image.$field
            }
            fn tables_mut(image: &mut ProcessImage) -> &mut TablePair<Self> {
                &mut image.$field
            }
        }
    };
}

macro_rules! impl_iec_float {
    ($t: ty, $atomic: ty, $field: ident) => {
        impl sealed::Sealed for $t {}
        impl IecType for $t {
            type Repr = $atomic;
            fn load(repr: &Self::Repr) -> Self {
                <$t>::from_bits(repr.load(Ordering::Relaxed))
            }
            fn store(repr: &Self::Repr, value: Self) {
                repr.store(value.to_bits(), Ordering::Relaxed);
            }
            fn tables(image: &ProcessImage) -> &TablePair<Self> {
                &image.$field
            }
            fn tables_mut(image: &mut ProcessImage) -> &mut TablePair<Self> {
                &mut image.$field
            }
        }
    };
}

impl_iec!(bool, AtomicBool, bits);
impl_iec!(i8, AtomicI8, sints);
impl_iec!(i16, AtomicI16, ints);
impl_iec!(i32, AtomicI32, dints);
impl_iec!(i64, AtomicI64, lints);
impl_iec!(u8, AtomicU8, usints);
impl_iec!(u16, AtomicU16, uints);
impl_iec!(u32, AtomicU32, udints);
impl_iec!(u64, AtomicU64, ulints);
impl_iec_float!(f32, AtomicU32, reals);
impl_iec_float!(f64, AtomicU64, lreals);

/// A single shared I/O cell.
///
/// Cells are created by the compiled program, bound into the image with
/// [`ProcessImage::bind()`] and kept by the program for its scan function.
/// Every `get`/`set` outside of initialization MUST happen with the image
/// lock held (see [`SharedImage`]); the cell itself does not verify this.
pub struct IoCell<T: IecType> {
    repr: T::Repr,
}

impl<T: IecType> IoCell<T> {
    /// Creates a new cell with the given initial value
    pub fn new(value: T) -> Self {
        let repr = T::Repr::default();
        T::store(&repr, value);
        Self { repr }
    }
    /// Reads the cell value
    pub fn get(&self) -> T {
        T::load(&self.repr)
    }
    /// Writes the cell value
    pub fn set(&self, value: T) {
        T::store(&self.repr, value);
    }
}

impl<T: IecType> Default for IoCell<T> {
    fn default() -> Self {
        Self::new(T::default())
    }
}

impl<T: IecType + fmt::Debug> fmt::Debug for IoCell<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "IoCell({:?})", self.get())
    }
}

struct SlotTable<T: IecType> {
    slots: Box<[Option<Arc<IoCell<T>>>]>,
}

impl<T: IecType> Default for SlotTable<T> {
    fn default() -> Self {
        Self {
            slots: (0..IMAGE_DIM * IMAGE_DIM).map(|_| None).collect(),
        }
    }
}

impl<T: IecType> SlotTable<T> {
    fn get(&self, major: usize, minor: usize) -> Option<&IoCell<T>> {
        if major < IMAGE_DIM && minor < IMAGE_DIM {
            self.slots[major * IMAGE_DIM + minor].as_deref()
        } else {
            None
        }
    }
    fn bind(&mut self, major: usize, minor: usize, cell: Arc<IoCell<T>>) -> Result<()> {
        if major >= IMAGE_DIM || minor >= IMAGE_DIM {
            return Err(Error::invalid_data(format!(
                "image slot ({},{}) out of range",
                major, minor
            )));
        }
        let slot = &mut self.slots[major * IMAGE_DIM + minor];
        if slot.is_some() {
            return Err(Error::SlotOccupied(format!("({},{})", major, minor)));
        }
        slot.replace(cell);
        Ok(())
    }
}

/// The input and output tables of one IEC type
#[doc(hidden)]
#[derive(Default)]
pub struct TablePair<T: IecType> {
    input: SlotTable<T>,
    output: SlotTable<T>,
}

impl<T: IecType> TablePair<T> {
    fn family(&self, family: Family) -> &SlotTable<T> {
        match family {
            Family::Input => &self.input,
            Family::Output => &self.output,
        }
    }
    fn family_mut(&mut self, family: Family) -> &mut SlotTable<T> {
        match family {
            Family::Input => &mut self.input,
            Family::Output => &mut self.output,
        }
    }
}

/// The process image: for each family and IEC type, an `IMAGE_DIM` ×
/// `IMAGE_DIM` table of optional cell handles.
///
/// The slot shape is fixed once the image is shared: [`ProcessImage::bind()`]
/// requires `&mut self`, while [`SharedImage`] only ever hands out shared
/// references, so the compiled program can populate slots during its init
/// step and nobody can rebind them afterwards.
#[derive(Default)]
pub struct ProcessImage {
    bits: TablePair<bool>,
    sints: TablePair<i8>,
    ints: TablePair<i16>,
    dints: TablePair<i32>,
    lints: TablePair<i64>,
    usints: TablePair<u8>,
    uints: TablePair<u16>,
    udints: TablePair<u32>,
    ulints: TablePair<u64>,
    reals: TablePair<f32>,
    lreals: TablePair<f64>,
    clock: SystemClock,
}

impl ProcessImage {
    /// Creates a new image with all slots empty
    pub fn new() -> Self {
        <_>::default()
    }
    /// Binds a cell at `(family, major, minor)` of the table for `T`.
    ///
    /// Fails if the coordinates are out of range or the slot is occupied.
    pub fn bind<T: IecType>(
        &mut self,
        family: Family,
        major: usize,
        minor: usize,
        cell: Arc<IoCell<T>>,
    ) -> Result<()> {
        T::tables_mut(self).family_mut(family).bind(major, minor, cell)
    }
    /// Returns the cell bound at `(family, major, minor)`, if any
    pub fn cell<T: IecType>(&self, family: Family, major: usize, minor: usize) -> Option<&IoCell<T>> {
        T::tables(self).family(family).get(major, minor)
    }
    /// Single-bit cell lookup by flattened protocol address
    /// (`major * 8 + minor`). Addresses whose row falls outside the table
    /// resolve to no slot.
    pub fn bit_cell(&self, family: Family, addr: u32) -> Option<&IoCell<bool>> {
        self.cell(family, (addr / 8) as usize, (addr % 8) as usize)
    }
    /// 16-bit register cell lookup by flattened protocol address: registers
    /// live in row 0 of the INT tables, the address is the column.
    pub fn register_cell(&self, family: Family, addr: u32) -> Option<&IoCell<i16>> {
        self.cell(family, 0, addr as usize)
    }
    /// The wall-clock image
    pub fn clock(&self) -> &SystemClock {
        &self.clock
    }
}

/// Readable cells mirroring the current UTC wall clock, refreshed once per
/// scan by the scheduler.
#[derive(Default, Debug)]
pub struct SystemClock {
    year: IoCell<u16>,
    month: IoCell<u16>,
    day: IoCell<u16>,
    hour: IoCell<u16>,
    minute: IoCell<u16>,
    second: IoCell<u16>,
    millisecond: IoCell<u16>,
}

#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
impl SystemClock {
    /// Year cell
    pub fn year(&self) -> &IoCell<u16> {
        &self.year
    }
    /// Month cell (1-12)
    pub fn month(&self) -> &IoCell<u16> {
        &self.month
    }
    /// Day-of-month cell (1-31)
    pub fn day(&self) -> &IoCell<u16> {
        &self.day
    }
    /// Hour cell (0-23)
    pub fn hour(&self) -> &IoCell<u16> {
        &self.hour
    }
    /// Minute cell
    pub fn minute(&self) -> &IoCell<u16> {
        &self.minute
    }
    /// Second cell
    pub fn second(&self) -> &IoCell<u16> {
        &self.second
    }
    /// Millisecond cell
    pub fn millisecond(&self) -> &IoCell<u16> {
        &self.millisecond
    }
    /// Decomposes the given instant into the clock cells
    pub fn update(&self, t: DateTime<Utc>) {
        self.year.set(t.year() as u16);
        self.month.set(t.month() as u16);
        self.day.set(t.day() as u16);
        self.hour.set(t.hour() as u16);
        self.minute.set(t.minute() as u16);
        self.second.set(t.second() as u16);
        self.millisecond.set(t.timestamp_subsec_millis() as u16);
    }
    /// Decomposes the current UTC time into the clock cells
    pub fn update_now(&self) {
        self.update(Utc::now());
    }
}

/// A cloneable handle to the image and its process-wide lock.
///
/// All runtime access to cell values goes through [`SharedImage::with_lock()`]
/// or [`SharedImage::lock()`]; holding the guard for the whole composite
/// operation is what gives the control program rung-to-rung atomicity.
#[derive(Clone)]
pub struct SharedImage {
    inner: Arc<Mutex<ProcessImage>>,
}

/// A held image lock, dereferencing to the image
pub struct ImageGuard<'a>(MutexGuard<'a, ProcessImage>);

impl Deref for ImageGuard<'_> {
    type Target = ProcessImage;
    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl SharedImage {
    /// Wraps a populated image for shared use
    pub fn new(image: ProcessImage) -> Self {
        Self {
            inner: Arc::new(Mutex::new(image)),
        }
    }
    /// Runs `f` with the image lock held
    pub fn with_lock<R>(&self, f: impl FnOnce(&ProcessImage) -> R) -> R {
        f(&self.inner.lock())
    }
    /// Acquires the image lock for a composite operation
    pub fn lock(&self) -> ImageGuard<'_> {
        ImageGuard(self.inner.lock())
    }
}
