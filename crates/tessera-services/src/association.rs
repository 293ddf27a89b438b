//! Route associations: "peer P is reachable through route record R".
//!
//! A node that listens somewhere publishes a route record (e.g. a TCP
//! address) and an association binding it to its own peer ref. The
//! association rides along whenever the peer ref is bundled. On arrival the
//! handler turns the record into a live route through the factory
//! registered for the record's type and adds it to the route table.

use std::sync::Arc;

use dashmap::DashMap;

use tessera_core::bundle::{AssociationHandler, AssociationRegistry};
use tessera_core::codec::{DecodeError, Schema, Value};
use tessera_core::mosaic::{Mosaic, MosaicError};
use tessera_core::{Object, Ref, TypeRegistry};

use crate::route::{SharedRoute, SharedRouteTable};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RouteAssociation {
    pub peer: Ref,
    pub route: Ref,
}

impl Object for RouteAssociation {
    const TYPE_NAME: &'static str = "tessera.route_association";

    fn schema() -> Schema {
        Schema::record([("peer", Schema::Ref), ("route", Schema::Ref)])
    }

    fn to_value(&self) -> Value {
        Value::Record(vec![Value::Ref(self.peer), Value::Ref(self.route)])
    }

    fn from_value(value: Value) -> Result<Self, DecodeError> {
        let mut f = value.into_fields(Self::TYPE_NAME)?;
        Ok(Self {
            peer: f.reference("peer")?,
            route: f.reference("route")?,
        })
    }
}

/// Builds live routes from one type of route record.
pub trait RouteFactory: Send + Sync {
    fn route_type(&self) -> &'static str;

    fn build(&self, record: Value) -> Result<SharedRoute, String>;
}

#[derive(Default)]
pub struct RouteFactories {
    factories: DashMap<String, Arc<dyn RouteFactory>>,
}

impl RouteFactories {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, factory: Arc<dyn RouteFactory>) {
        self.factories.insert(factory.route_type().to_string(), factory);
    }

    pub fn get(&self, route_type: &str) -> Option<Arc<dyn RouteFactory>> {
        self.factories.get(route_type).map(|f| Arc::clone(f.value()))
    }
}

pub struct RouteAssociationHandler {
    mosaic: Arc<Mosaic>,
    types: Arc<TypeRegistry>,
    table: SharedRouteTable,
    factories: Arc<RouteFactories>,
}

impl RouteAssociationHandler {
    pub fn new(
        mosaic: Arc<Mosaic>,
        types: Arc<TypeRegistry>,
        table: SharedRouteTable,
        factories: Arc<RouteFactories>,
    ) -> Self {
        Self {
            mosaic,
            types,
            table,
            factories,
        }
    }
}

impl AssociationHandler for RouteAssociationHandler {
    fn apply(&self, _association: &Ref, value: Value) -> Result<(), String> {
        let association = RouteAssociation::from_value(value).map_err(|e| e.to_string())?;
        let record = self
            .mosaic
            .resolve(&association.route)
            .map_err(|e| e.to_string())?;

        // Transports we don't speak are someone else's business.
        let Some(factory) = self.factories.get(&record.full_type_name) else {
            tracing::debug!(route_type = %record.full_type_name, "ignoring route of unknown type");
            return Ok(());
        };
        let value = self
            .mosaic
            .resolve_typed(&association.route, &self.types)
            .map_err(|e| e.to_string())?;
        let route = factory.build(value)?;
        self.table.add_route(association.peer, route);
        Ok(())
    }
}

/// Store `record` and bind it to `peer` so it travels with the peer ref.
pub fn publish_route<T: Object>(
    mosaic: &Mosaic,
    associations: &AssociationRegistry,
    peer: Ref,
    record: &T,
) -> Result<Ref, MosaicError> {
    let route = mosaic.put(record)?;
    let association = mosaic.put(&RouteAssociation { peer, route })?;
    if associations.associate(peer, association) {
        tracing::info!(peer = %peer.short(), route_type = T::TYPE_NAME, "route published");
    }
    Ok(association)
}
