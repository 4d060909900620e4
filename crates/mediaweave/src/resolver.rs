//! Topology resolver
//!
//! Turns a partial topology into a playable one. Every output node is traced
//! back to its source stream, the media type flowing into the output is
//! negotiated against the sink's type handler, and converters or decoders
//! from the [`TransformRegistry`] are spliced in where the two sides do not
//! agree.

use std::collections::HashSet;
use std::sync::Arc;

use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::descriptor::MediaTypeHandler;
use crate::error::{MediaError, MediaResult};
use crate::media_type::MediaType;
use crate::topology::{ConnectMethod, NodeKind, NodeObject, Topology, TopologyNode};
use crate::transform::{Transform, TransformCategory, TransformRegistry};

/// One transform chosen for insertion.
struct Insertion {
    name: String,
    transform: Arc<dyn Transform>,
    decoder: bool,
}

pub struct TopologyResolver {
    registry: Arc<TransformRegistry>,
}

impl TopologyResolver {
    /// Resolver with an empty registry: only direct connections succeed.
    pub fn new() -> Self {
        Self::with_registry(Arc::new(TransformRegistry::new()))
    }

    pub fn with_registry(registry: Arc<TransformRegistry>) -> Self {
        Self { registry }
    }

    pub fn registry(&self) -> &Arc<TransformRegistry> {
        &self.registry
    }

    // =========================================================================
    // VALIDATION
    // =========================================================================

    /// Check that every output traces back to a selected source stream and
    /// has a sink. Touches no media types.
    pub fn validate(&self, topology: &Topology) -> MediaResult<()> {
        if topology.is_empty() {
            return Err(MediaError::TopoUnsupported("topology has no nodes"));
        }
        let outputs = topology.output_nodes();
        if outputs.is_empty() {
            return Err(MediaError::TopoUnsupported("topology has no output nodes"));
        }

        for output in outputs {
            let source_id = trace_source(topology, output)?;
            check_source_node(topology, source_id)?;

            let has_sink = topology.node(output).and_then(|n| n.sink()).is_some();
            if !has_sink {
                return Err(MediaError::TopoMissingSink(output));
            }
        }
        Ok(())
    }

    // =========================================================================
    // RESOLUTION
    // =========================================================================

    /// Produce a resolved copy of `topology`. The copy keeps the topology id
    /// but is a distinct instance; the input is never modified.
    pub fn resolve(&self, topology: &Topology) -> MediaResult<Topology> {
        self.validate(topology)?;

        let mut resolved = topology.clone();
        for output in topology.output_nodes() {
            self.resolve_branch(&mut resolved, output)?;
        }

        info!(
            "Resolved topology {} ({} nodes)",
            resolved.id(),
            resolved.node_count()
        );
        Ok(resolved)
    }

    fn resolve_branch(&self, topology: &mut Topology, output: Uuid) -> MediaResult<()> {
        let node = topology
            .node(output)
            .ok_or(MediaError::NodeNotFound(output))?;
        let method = node.connect_method;
        let handler = node
            .sink()
            .ok_or(MediaError::TopoMissingSink(output))?
            .media_type_handler()?;

        let (upstream, edge) = topology
            .inputs(output)
            .first()
            .copied()
            .ok_or(MediaError::TopoUnsupported("output is not connected"))?;
        let upstream_type = upstream_type(topology, upstream, edge.output_index, &mut HashSet::new())?;
        debug!("Negotiating {} into output {}", upstream_type, output);

        match self.negotiate(handler.as_ref(), &upstream_type, method)? {
            None => Ok(()),
            Some(chain) => {
                let mut previous = upstream;
                for insertion in chain {
                    let mut node = TopologyNode::transform(&insertion.name, insertion.transform);
                    node.decoder = insertion.decoder;
                    info!(
                        "Inserted {} {} before output {}",
                        if insertion.decoder { "decoder" } else { "converter" },
                        insertion.name,
                        output
                    );
                    previous = topology.insert_between(node, previous, output)?;
                }
                Ok(())
            }
        }
    }

    /// Settle the sink's type. `Ok(None)` means a direct connection.
    fn negotiate(
        &self,
        handler: &dyn MediaTypeHandler,
        upstream: &MediaType,
        method: ConnectMethod,
    ) -> MediaResult<Option<Vec<Insertion>>> {
        // A sink that already has a type only takes that type
        if let Ok(current) = handler.current_media_type() {
            if current.matches_items(upstream) && handler.is_media_type_supported(upstream).is_ok() {
                return Ok(None);
            }
            if let Some((chain, _)) = self.find_chain(upstream, &Target::Type(&current), method) {
                return Ok(Some(chain));
            }
            return Err(MediaError::InvalidMediaType);
        }

        let candidates = candidate_types(handler)?;
        if candidates.is_empty() {
            return self.negotiate_unlisted(handler, upstream, method);
        }

        for candidate in &candidates {
            if !candidate.matches_items(upstream) || handler.is_media_type_supported(candidate).is_err() {
                continue;
            }
            match handler.set_current_media_type(candidate) {
                Ok(()) => return Ok(None),
                Err(e) => debug!("Sink refused {} as its type: {}", candidate, e),
            }
        }

        for candidate in &candidates {
            if handler.is_media_type_supported(candidate).is_err() {
                continue;
            }
            let Some((chain, _)) = self.find_chain(upstream, &Target::Type(candidate), method) else {
                continue;
            };
            match handler.set_current_media_type(candidate) {
                Ok(()) => return Ok(Some(chain)),
                Err(e) => debug!("Sink refused {} behind a transform: {}", candidate, e),
            }
        }

        if method.intersects(ConnectMethod::ALLOW_DECODER) {
            Err(MediaError::TopoCodecNotFound)
        } else {
            Err(MediaError::InvalidMediaType)
        }
    }

    /// Sink with nothing to enumerate: take the upstream type if the handler
    /// accepts it, else whatever a transform chain produces that it accepts.
    fn negotiate_unlisted(
        &self,
        handler: &dyn MediaTypeHandler,
        upstream: &MediaType,
        method: ConnectMethod,
    ) -> MediaResult<Option<Vec<Insertion>>> {
        if handler.is_media_type_supported(upstream).is_ok() {
            match handler.set_current_media_type(upstream) {
                Ok(()) => return Ok(None),
                Err(e) => debug!("Sink refused {} as its type: {}", upstream, e),
            }
        }

        if let Some((chain, output)) = self.find_chain(upstream, &Target::Handler(handler), method) {
            handler.set_current_media_type(&output)?;
            return Ok(Some(chain));
        }

        // Nothing listed, nothing set and nothing convertible: not ready
        Err(handler
            .current_media_type()
            .err()
            .unwrap_or(MediaError::NotInitialized))
    }

    /// Converter, decoder, or decoder followed by converter, taking `input`
    /// to something `target` takes. Also returns the chain's output type.
    fn find_chain(
        &self,
        input: &MediaType,
        target: &Target<'_>,
        method: ConnectMethod,
    ) -> Option<(Vec<Insertion>, MediaType)> {
        if !method.contains(ConnectMethod::ALLOW_CONVERTER) {
            return None;
        }

        if let Some((converter, output)) = self.find_transform(TransformCategory::Converter, input, target) {
            return Some((vec![converter], output));
        }

        if method.contains(ConnectMethod::ALLOW_DECODER) {
            if let Some((decoder, output)) = self.find_transform(TransformCategory::Decoder, input, target) {
                return Some((vec![decoder], output));
            }
            // Decode to whatever the decoder offers, then convert
            if let Some((decoder, decoded)) = self.find_transform(TransformCategory::Decoder, input, &Target::Any) {
                if let Some((converter, output)) =
                    self.find_transform(TransformCategory::Converter, &decoded, target)
                {
                    return Some((vec![decoder, converter], output));
                }
            }
        }
        None
    }

    /// First registered transform accepting `input` with an output type
    /// `target` takes.
    fn find_transform(
        &self,
        category: TransformCategory,
        input: &MediaType,
        target: &Target<'_>,
    ) -> Option<(Insertion, MediaType)> {
        for registration in self.registry.find(category, input) {
            let transform = match registration.create() {
                Ok(transform) => transform,
                Err(e) => {
                    warn!("Could not create transform {}: {}", registration.name, e);
                    continue;
                }
            };
            if transform.set_input_type(0, input).is_err() {
                continue;
            }

            let mut index = 0;
            while let Ok(offered) = transform.output_available_type(0, index) {
                index += 1;
                let Some(output) = target.pick(offered) else {
                    continue;
                };
                if transform.set_output_type(0, &output).is_ok() {
                    debug!("Transform {} takes {} to {}", registration.name, input, output);
                    return Some((
                        Insertion {
                            name: registration.name.clone(),
                            transform,
                            decoder: category == TransformCategory::Decoder,
                        },
                        output,
                    ));
                }
            }
        }
        None
    }
}

/// What the end of an inserted chain has to produce.
enum Target<'a> {
    /// A type the sink listed or is committed to.
    Type(&'a MediaType),
    /// Anything the sink's handler accepts.
    Handler(&'a dyn MediaTypeHandler),
    /// Whatever the transform offers first.
    Any,
}

impl Target<'_> {
    /// Output type to set when the transform offers `offered`.
    fn pick(&self, offered: MediaType) -> Option<MediaType> {
        match self {
            Target::Type(target) => offered.matches_items(target).then(|| (*target).clone()),
            Target::Handler(handler) => handler.is_media_type_supported(&offered).is_ok().then_some(offered),
            Target::Any => Some(offered),
        }
    }
}

impl Default for TopologyResolver {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for TopologyResolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TopologyResolver")
            .field("transforms", &self.registry.len())
            .finish()
    }
}

/// Walk from `output` up its first inputs to the source stream node.
fn trace_source(topology: &Topology, output: Uuid) -> MediaResult<Uuid> {
    let mut current = output;
    loop {
        let (upstream, _) = topology
            .inputs(current)
            .first()
            .copied()
            .ok_or(MediaError::TopoUnsupported("output is not connected to a source"))?;
        let node = topology
            .node(upstream)
            .ok_or(MediaError::NodeNotFound(upstream))?;
        match node.kind() {
            NodeKind::SourceStream => return Ok(upstream),
            NodeKind::Output => {
                return Err(MediaError::TopoUnsupported("output node feeds another node"))
            }
            NodeKind::Transform | NodeKind::Tee => current = upstream,
        }
    }
}

fn check_source_node(topology: &Topology, id: Uuid) -> MediaResult<()> {
    let node = topology.node(id).ok_or(MediaError::NodeNotFound(id))?;
    if node.source().is_none() {
        return Err(MediaError::TopoMissingSource(id));
    }
    let (Some(presentation), Some(stream)) = (node.presentation(), node.stream()) else {
        return Err(MediaError::TopoMissingDescriptor(id));
    };
    if !presentation.is_selected(stream.identifier()) {
        return Err(MediaError::StreamNotSelected(id));
    }
    Ok(())
}

/// Handler candidates in index order.
fn candidate_types(handler: &dyn MediaTypeHandler) -> MediaResult<Vec<MediaType>> {
    let count = handler.media_type_count()?;
    let mut types = Vec::with_capacity(count);
    for index in 0..count {
        match handler.media_type_by_index(index) {
            Ok(media_type) => types.push(media_type),
            Err(MediaError::NoMoreTypes) => break,
            Err(e) => return Err(e),
        }
    }
    Ok(types)
}

/// Media type leaving `output_index` of `id`.
fn upstream_type(
    topology: &Topology,
    id: Uuid,
    output_index: u32,
    visited: &mut HashSet<Uuid>,
) -> MediaResult<MediaType> {
    if !visited.insert(id) {
        return Err(MediaError::CycleDetected);
    }
    let node = topology.node(id).ok_or(MediaError::NodeNotFound(id))?;

    match &node.object {
        NodeObject::SourceStream { stream, .. } => {
            let handler = stream
                .as_ref()
                .ok_or(MediaError::TopoMissingDescriptor(id))?
                .media_type_handler();
            handler
                .current_media_type()
                .or_else(|_| handler.media_type_by_index(0))
        }
        NodeObject::Transform(transform) => {
            let transform = transform
                .as_ref()
                .ok_or(MediaError::TopoUnsupported("transform node has no transform"))?;
            if let Ok(current) = transform.output_current_type(output_index) {
                return Ok(current);
            }
            if transform.input_current_type(0).is_err() {
                let (feeder, edge) = topology
                    .inputs(id)
                    .first()
                    .copied()
                    .ok_or(MediaError::TopoUnsupported("transform node has no input"))?;
                let input = upstream_type(topology, feeder, edge.output_index, visited)?;
                transform.set_input_type(0, &input)?;
            }
            let output = transform.output_available_type(output_index, 0)?;
            transform.set_output_type(output_index, &output)?;
            Ok(output)
        }
        NodeObject::Tee => {
            let (feeder, edge) = topology
                .inputs(id)
                .first()
                .copied()
                .ok_or(MediaError::TopoUnsupported("tee node has no input"))?;
            upstream_type(topology, feeder, edge.output_index, visited)
        }
        NodeObject::Output(_) => Err(MediaError::TopoUnsupported("output node feeds another node")),
    }
}
