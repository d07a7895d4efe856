// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

// Element wiring. A deployment instantiates one TcpIn/TcpOut pair per direction; the pairs reference each other by
// name (OUTNAME for the paired outbound element, RETURNNAME for the reverse-direction inbound element) and the names
// are resolved against this registry once, at configure time. The registry also owns the state both directions
// share: the flow table and the object pools.

//======================================================================================================================
// Imports
//======================================================================================================================

use crate::{
    middlebox::{
        fcb::{ConnectionTable, FlowDirection, MiddleboxPools},
        tcp_in::TcpIn,
        tcp_out::TcpOut,
    },
    runtime::{fail::Fail, network::config::MiddleboxConfig},
};
use ::hashbrown::HashMap;
use ::libc::{EEXIST, EINVAL, ENOENT};
use ::std::{cell::RefCell, rc::Rc};

//======================================================================================================================
// Structures
//======================================================================================================================

/// Registry of pipeline elements, keyed by element name.
pub struct ElementRegistry {
    /// Configuration shared by every element.
    config: MiddleboxConfig,

    /// Object pools shared by every element.
    pools: Rc<RefCell<MiddleboxPools>>,

    /// Flow table shared by both directions.
    table: Rc<RefCell<ConnectionTable>>,

    /// Inbound elements.
    tcp_ins: HashMap<String, Rc<RefCell<TcpIn>>>,

    /// Outbound elements.
    tcp_outs: HashMap<String, Rc<RefCell<TcpOut>>>,
}

//======================================================================================================================
// Associated Functions
//======================================================================================================================

impl ElementRegistry {
    /// Creates a registry with fresh shared state.
    pub fn new(config: MiddleboxConfig) -> Self {
        let pools: Rc<RefCell<MiddleboxPools>> = Rc::new(RefCell::new(MiddleboxPools::new(&config)));
        let table: Rc<RefCell<ConnectionTable>> =
            Rc::new(RefCell::new(ConnectionTable::new(config.get_idle_timeout())));
        Self {
            config,
            pools,
            table,
            tcp_ins: HashMap::new(),
            tcp_outs: HashMap::new(),
        }
    }

    /// Instantiates the outbound element `name` for `direction`.
    pub fn create_tcp_out(&mut self, name: &str, direction: u8) -> Result<Rc<RefCell<TcpOut>>, Fail> {
        if self.tcp_outs.contains_key(name) {
            return Err(Fail::new(EEXIST, "element name already taken"));
        }
        let direction: FlowDirection = FlowDirection::new(direction)?;
        let element: Rc<RefCell<TcpOut>> = Rc::new(RefCell::new(TcpOut::new(
            direction,
            self.config.clone(),
            self.pools.clone(),
        )));
        self.tcp_outs.insert(name.to_string(), element.clone());
        Ok(element)
    }

    /// Instantiates the inbound element `name` for `direction`, paired with the outbound element `out_name` and the
    /// reverse inbound element `return_name`. The outbound element must already exist and write the same direction;
    /// the reverse element may be instantiated later and is checked by `finalize`.
    pub fn create_tcp_in(
        &mut self,
        name: &str,
        direction: u8,
        out_name: &str,
        return_name: &str,
    ) -> Result<Rc<RefCell<TcpIn>>, Fail> {
        if self.tcp_ins.contains_key(name) {
            return Err(Fail::new(EEXIST, "element name already taken"));
        }
        if name == return_name {
            return Err(Fail::new(EINVAL, "element cannot be its own return element"));
        }
        let direction: FlowDirection = FlowDirection::new(direction)?;

        let out: Rc<RefCell<TcpOut>> = self
            .tcp_outs
            .get(out_name)
            .cloned()
            .ok_or_else(|| Fail::new(ENOENT, "no such outbound element"))?;
        if out.borrow().direction() != direction {
            return Err(Fail::new(EINVAL, "outbound element writes the other direction"));
        }

        let element: Rc<RefCell<TcpIn>> = Rc::new(RefCell::new(TcpIn::new(
            direction,
            self.config.clone(),
            self.pools.clone(),
            self.table.clone(),
            out,
            return_name.to_string(),
        )));
        self.tcp_ins.insert(name.to_string(), element.clone());
        Ok(element)
    }

    /// Verifies the cross references between elements: every RETURNNAME must resolve to an inbound element reading
    /// the opposite direction.
    pub fn finalize(&self) -> Result<(), Fail> {
        for (name, element) in self.tcp_ins.iter() {
            let element = element.borrow();
            let peer: &Rc<RefCell<TcpIn>> = self
                .tcp_ins
                .get(element.return_name())
                .ok_or_else(|| Fail::new(ENOENT, "no such return element"))?;
            if peer.borrow().direction() != element.direction().opposite() {
                error!("return element of {} reads the same direction", name);
                return Err(Fail::new(EINVAL, "return element reads the same direction"));
            }
        }
        Ok(())
    }

    /// Looks up an inbound element.
    pub fn tcp_in(&self, name: &str) -> Option<Rc<RefCell<TcpIn>>> {
        self.tcp_ins.get(name).cloned()
    }

    /// Looks up an outbound element.
    pub fn tcp_out(&self, name: &str) -> Option<Rc<RefCell<TcpOut>>> {
        self.tcp_outs.get(name).cloned()
    }

    /// The flow table shared by both directions.
    pub fn table(&self) -> Rc<RefCell<ConnectionTable>> {
        self.table.clone()
    }

    /// The object pools shared by every element.
    pub fn pools(&self) -> Rc<RefCell<MiddleboxPools>> {
        self.pools.clone()
    }
}

//======================================================================================================================
// Unit Tests
//======================================================================================================================
