// SPDX-License-Identifier: GPL-2.0
//
// ARMv8 PMU event catalog and event-list parsing.
//
// Abridged set of useful PMU events; see the Armv8-A Performance
// Monitoring User Guide for the full list.

use anyhow::{bail, Result};

struct EventType {
    name: &'static str,
    code: u64,
}

static ARMV8_PMU_EVENTS: &[EventType] = &[
    EventType { name: "l1i_cache_refill", code: 0x0001 },
    EventType { name: "l1d_cache_refill", code: 0x0003 },
    EventType { name: "l1d_cache", code: 0x0004 },
    EventType { name: "ld_retired", code: 0x0006 },
    EventType { name: "st_retired", code: 0x0007 },
    EventType { name: "inst_retired", code: 0x0008 },
    EventType { name: "exc_taken", code: 0x0009 },
    EventType { name: "exc_return", code: 0x000a },
    EventType { name: "pc_write_retired", code: 0x000c },
    EventType { name: "br_immed_retired", code: 0x000d },
    EventType { name: "br_return_retired", code: 0x000e },
    EventType { name: "unaligned_ldst_retired", code: 0x000f },
    EventType { name: "br_mis_pred", code: 0x0010 },
    EventType { name: "cpu_cycles", code: 0x0011 },
    EventType { name: "br_pred", code: 0x0012 },
    EventType { name: "mem_access", code: 0x0013 },
    EventType { name: "l1i_cache", code: 0x0014 },
    EventType { name: "l1d_cache_wb", code: 0x0015 },
    EventType { name: "l2d_cache", code: 0x0016 },
    EventType { name: "l2d_cache_refill", code: 0x0017 },
    EventType { name: "l2d_cache_wb", code: 0x0018 },
    EventType { name: "bus_access", code: 0x0019 },
    EventType { name: "memory_error", code: 0x001a },
    EventType { name: "inst_spec", code: 0x001b },
    EventType { name: "bus_cycles", code: 0x001d },
];

/// Look up the raw hardware code for a symbolic event name.
pub fn code_for(name: &str) -> Option<u64> {
    ARMV8_PMU_EVENTS
        .iter()
        .find(|ev| ev.name == name)
        .map(|ev| ev.code)
}

/// Look up the symbolic name for a raw hardware code.
pub fn name_for(code: u64) -> Option<&'static str> {
    ARMV8_PMU_EVENTS
        .iter()
        .find(|ev| ev.code == code)
        .map(|ev| ev.name)
}

/// One configured hardware counter. The set is fixed at startup; `id`
/// and `fd` are assigned when the counter group is opened, and only
/// `value` changes after that.
#[derive(Debug)]
pub struct CounterSpec {
    pub name: &'static str,
    pub code: u64,
    /// Kernel-assigned counter identity (PERF_EVENT_IOC_ID).
    pub id: u64,
    pub fd: i32,
    /// Last observed cumulative value.
    pub value: u64,
}

/// Parse a comma-separated event list like
/// `cpu_cycles,inst_retired,l2d_cache` into counter specs.
///
/// An unknown event name aborts configuration before any counter is
/// opened.
pub fn parse_event_list(list: &str) -> Result<Vec<CounterSpec>> {
    let mut specs = Vec::new();

    for token in list.split(',') {
        let token = token.trim();
        if token.is_empty() {
            bail!("empty event name in list {:?}", list);
        }
        let Some(code) = code_for(token) else {
            bail!("unknown event type {:?}", token);
        };
        specs.push(CounterSpec {
            // Canonical static name, not the caller's slice.
            name: name_for(code).unwrap(),
            code,
            id: 0,
            fd: -1,
            value: 0,
        });
    }

    if specs.is_empty() {
        bail!("event list is empty");
    }

    Ok(specs)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn catalog_round_trip() {
        assert_eq!(code_for("cpu_cycles"), Some(0x0011));
        assert_eq!(code_for("l2d_cache_refill"), Some(0x0017));
        assert_eq!(name_for(0x0010), Some("br_mis_pred"));
        assert_eq!(code_for("not_an_event"), None);
        assert_eq!(name_for(0xffff), None);
    }

    #[test]
    fn parses_full_event_list() {
        let specs =
            parse_event_list("cpu_cycles,inst_retired,l2d_cache,l2d_cache_refill,br_mis_pred")
                .unwrap();
        assert_eq!(specs.len(), 5);
        assert_eq!(specs[0].name, "cpu_cycles");
        assert_eq!(specs[0].code, 0x0011);
        assert_eq!(specs[1].code, 0x0008);
        assert_eq!(specs[4].code, 0x0010);
        for spec in &specs {
            assert_eq!(spec.fd, -1);
            assert_eq!(spec.value, 0);
        }
    }

    #[test]
    fn unknown_event_aborts() {
        let err = parse_event_list("cpu_cycles,bogus_event,inst_retired").unwrap_err();
        assert!(err.to_string().contains("bogus_event"));
    }

    #[test]
    fn empty_list_aborts() {
        assert!(parse_event_list("").is_err());
        assert!(parse_event_list("cpu_cycles,,inst_retired").is_err());
    }
}
