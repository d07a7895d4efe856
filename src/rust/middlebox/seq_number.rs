// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

// This file defines a type to represent a TCP Sequence Number.
//
// The sequence number space of RFC 793 ranges from 0 to 2^32 - 1 and wraps around, so all arithmetic on sequence
// numbers must be performed modulo 2^32. Excluding equality, comparisons between sequence numbers are non-transitive:
// for distinct a, b, c one can have a < b < c < a. We therefore give sequence numbers their own type and restrict the
// operations on it to the ones that remain meaningful under wrap-around.
//

use std::{cmp::Ordering, convert::From, fmt};

// Internally, sequence numbers are stored as unsigned 32-bit integers. Cloning, copying, construction and equality
// behave as for u32; everything else is defined explicitly below.
//
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Hash)]
pub struct SeqNumber {
    value: u32,
}

// To create a u32 from a sequence number.
impl From<SeqNumber> for u32 {
    #[inline]
    fn from(item: SeqNumber) -> u32 {
        item.value
    }
}

// To create a sequence number from a u32.
impl From<u32> for SeqNumber {
    #[inline]
    fn from(item: u32) -> Self {
        SeqNumber { value: item }
    }
}

// Display a sequence number.
impl fmt::Display for SeqNumber {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        self.value.fmt(f)
    }
}

// Add two sequence numbers together.
impl std::ops::Add for SeqNumber {
    type Output = SeqNumber;

    #[inline]
    fn add(self, other: SeqNumber) -> SeqNumber {
        (self.value.wrapping_add(other.value)).into()
    }
}

// Subtract a sequence number from another one.
impl std::ops::Sub for SeqNumber {
    type Output = SeqNumber;

    #[inline]
    fn sub(self, other: SeqNumber) -> SeqNumber {
        (self.value.wrapping_sub(other.value)).into()
    }
}

// We implement the PartialOrd trait to get "<", "<=", ">" and ">=" with TCP's serial-number semantics:
// a < b iff (a - b) mod 2^32, reinterpreted as a signed 32-bit integer, is negative. Sequence numbers are not actually
// a partially ordered set, so partial_cmp itself has no sound definition; to keep callers from relying on one by
// accident it panics instead of answering.
impl std::cmp::PartialOrd for SeqNumber {
    fn partial_cmp(&self, _other: &Self) -> Option<Ordering> {
        panic!("sequence numbers cannot be totally ordered; use the comparison operators");
    }

    #[inline]
    fn lt(&self, other: &Self) -> bool {
        (self.value.wrapping_sub(other.value) as i32) < 0
    }

    #[inline]
    fn le(&self, other: &Self) -> bool {
        (self.value.wrapping_sub(other.value) as i32) <= 0
    }

    #[inline]
    fn gt(&self, other: &Self) -> bool {
        (self.value.wrapping_sub(other.value) as i32) > 0
    }

    #[inline]
    fn ge(&self, other: &Self) -> bool {
        (self.value.wrapping_sub(other.value) as i32) >= 0
    }
}

// Note that we specifically don't implement Ord: there is no max or min sequence number, and three or more of them
// cannot be sorted into a unique order.
