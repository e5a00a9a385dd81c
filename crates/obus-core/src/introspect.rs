//! Machine-generated introspection XML.
//!
//! Every object without a custom override renders a DOCTYPE-tagged `<node>`
//! nesting its attached interfaces plus the generated Introspectable,
//! Properties, and Peer built-ins. Annotations render as child elements in
//! declaration order; registered descendants appear as child `<node>` stubs.

use crate::interface::{
    introspectable_interface, peer_interface, properties_interface, Annotation,
    InterfaceDescription, MethodDef, PropertyDef, SignalDef,
};
use crate::object::BusObject;

const DOCTYPE: &str = "<!DOCTYPE node PUBLIC \"-//freedesktop//DTD D-BUS Object Introspection 1.0//EN\"\n\"http://www.freedesktop.org/standards/dbus/1.0/introspect.dtd\">";

fn escape(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            other => out.push(other),
        }
    }
    out
}

fn write_annotations(out: &mut String, indent: &str, annotations: &[Annotation]) {
    for a in annotations {
        out.push_str(&format!(
            "{}<annotation name=\"{}\" value=\"{}\"/>\n",
            indent,
            escape(&a.name),
            escape(&a.value)
        ));
    }
}

fn write_method(out: &mut String, method: &MethodDef) {
    out.push_str(&format!("    <method name=\"{}\">\n", escape(&method.name)));
    let names = &method.arg_names;
    for (i, node) in method.in_sig.nodes().iter().enumerate() {
        let name = names.get(i).map(String::as_str).unwrap_or("");
        out.push_str(&format!(
            "      <arg name=\"{}\" type=\"{}\" direction=\"in\"/>\n",
            escape(name),
            node.signature_string()
        ));
    }
    let in_count = method.in_sig.len();
    for (i, node) in method.out_sig.nodes().iter().enumerate() {
        let name = names.get(in_count + i).map(String::as_str).unwrap_or("");
        out.push_str(&format!(
            "      <arg name=\"{}\" type=\"{}\" direction=\"out\"/>\n",
            escape(name),
            node.signature_string()
        ));
    }
    write_annotations(out, "      ", &method.annotations);
    out.push_str("    </method>\n");
}

fn write_signal(out: &mut String, signal: &SignalDef) {
    out.push_str(&format!("    <signal name=\"{}\">\n", escape(&signal.name)));
    for (i, node) in signal.sig.nodes().iter().enumerate() {
        let name = signal.arg_names.get(i).map(String::as_str).unwrap_or("");
        out.push_str(&format!(
            "      <arg name=\"{}\" type=\"{}\"/>\n",
            escape(name),
            node.signature_string()
        ));
    }
    write_annotations(out, "      ", &signal.annotations);
    out.push_str("    </signal>\n");
}

fn write_property(out: &mut String, property: &PropertyDef) {
    if property.annotations.is_empty() {
        out.push_str(&format!(
            "    <property name=\"{}\" type=\"{}\" access=\"{}\"/>\n",
            escape(&property.name),
            property.sig.signature_string(),
            property.access.as_str()
        ));
    } else {
        out.push_str(&format!(
            "    <property name=\"{}\" type=\"{}\" access=\"{}\">\n",
            escape(&property.name),
            property.sig.signature_string(),
            property.access.as_str()
        ));
        write_annotations(out, "      ", &property.annotations);
        out.push_str("    </property>\n");
    }
}

fn write_interface(out: &mut String, iface: &InterfaceDescription) {
    out.push_str(&format!("  <interface name=\"{}\">\n", escape(&iface.name)));
    write_annotations(out, "    ", &iface.annotations);
    for m in &iface.methods {
        write_method(out, m);
    }
    for s in &iface.signals {
        write_signal(out, s);
    }
    for p in &iface.properties {
        write_property(out, p);
    }
    out.push_str("  </interface>\n");
}

/// Render a stub document for a path that hosts no object but has
/// registered descendants.
pub fn introspect_stub(path: &str, children: &[String]) -> String {
    let mut out = String::new();
    out.push_str(DOCTYPE);
    out.push('\n');
    out.push_str(&format!("<node name=\"{}\">\n", escape(path)));
    let mut direct: Vec<&str> = children
        .iter()
        .map(|c| c.split('/').next().unwrap_or(c.as_str()))
        .collect();
    direct.dedup();
    for child in direct {
        out.push_str(&format!("  <node name=\"{}\"/>\n", escape(child)));
    }
    out.push_str("</node>\n");
    out
}

/// Render the introspection document for `object`.
///
/// `children` are registered descendant paths relative to the object. A
/// custom override on the object replaces the generated document entirely.
pub fn introspect(object: &BusObject, children: &[String]) -> String {
    if let Some(custom) = object.introspection_override() {
        return custom.to_string();
    }

    let mut out = String::new();
    out.push_str(DOCTYPE);
    out.push('\n');
    out.push_str(&format!("<node name=\"{}\">\n", escape(object.path())));

    for iface in object.interfaces() {
        write_interface(&mut out, iface);
    }
    write_interface(&mut out, &introspectable_interface());
    if object.has_properties() {
        write_interface(&mut out, &properties_interface());
    }
    write_interface(&mut out, &peer_interface());

    // Only immediate children get stubs; deeper paths introspect from there.
    let mut direct: Vec<&str> = children
        .iter()
        .map(|c| c.split('/').next().unwrap_or(c.as_str()))
        .collect();
    direct.dedup();
    for child in direct {
        out.push_str(&format!("  <node name=\"{}\"/>\n", escape(child)));
    }

    out.push_str("</node>\n");
    out
}

// ============================================================================
// Unit Tests
// ============================================================================
