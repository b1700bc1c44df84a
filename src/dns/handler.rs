//! DNS query policy
//!
//! Decides what every inbound query gets: a sample of good addresses for
//! A/AAAA at the zone, NS/SOA for zone metadata, REFUSED for anything
//! outside the zone. Clients may encode a services requirement as an
//! `x<decimal>` label in front of the zone.

use std::net::IpAddr;
use std::sync::Arc;

use tracing::debug;

use crate::config::Config;
use crate::manager::{unix_now, AddressManager};
use crate::metrics::Metrics;
use crate::types::{IpFamily, ServiceFlags, SubnetworkId};

use super::message::{
    parse_request, RData, Record, Request, Response, SoaData, CLASS_IN, MAX_UDP_PAYLOAD,
    MIN_UDP_PAYLOAD, RCODE_FORMERR, RCODE_NOERROR, RCODE_NOTIMP, RCODE_REFUSED, TYPE_A, TYPE_AAAA,
    TYPE_ANY, TYPE_NS, TYPE_SOA,
};

/// Most addresses handed out per response.
pub const MAX_ANSWERS: usize = 16;

/// TTL of address answers.
pub const ADDRESS_TTL: u32 = 60;

/// TTL of the NS and SOA answers.
pub const NS_TTL: u32 = 86_400;

const SOA_REFRESH: u32 = 3_600;
const SOA_RETRY: u32 = 900;
const SOA_EXPIRE: u32 = 604_800;
const SOA_MINIMUM: u32 = 60;

/// Stateless per-query policy over the shared address table.
pub struct DnsHandler {
    manager: Arc<AddressManager>,
    metrics: Arc<Metrics>,
    zone: String,
    nameserver: String,
    soa_rname: String,
    default_services: ServiceFlags,
    subnetwork_filter: Option<SubnetworkId>,
}

impl DnsHandler {
    pub fn new(manager: Arc<AddressManager>, metrics: Arc<Metrics>, config: &Config) -> Self {
        Self {
            manager,
            metrics,
            zone: config.zone(),
            nameserver: config.nameserver_name(),
            soa_rname: config.soa_rname(),
            default_services: config.default_services,
            subnetwork_filter: config.subnetwork_filter,
        }
    }

    /// Turn a raw packet into a response, or `None` when the packet is
    /// too mangled to even echo an id.
    pub fn handle(&self, packet: &[u8]) -> Option<Response> {
        self.metrics.inc_dns_queries();

        let request = match parse_request(packet) {
            Ok(request) => request,
            Err(e) => {
                debug!("unparseable query: {}", e);
                if packet.len() < 4 {
                    return None;
                }
                let id = u16::from_be_bytes([packet[0], packet[1]]);
                return Some(Response::empty(id, false, RCODE_FORMERR));
            }
        };

        Some(self.answer(request))
    }

    fn answer(&self, request: Request) -> Response {
        let mut response = Response::empty(request.id, request.rd, RCODE_NOERROR);
        if let Some(payload) = request.edns_payload {
            response.edns = true;
            response.udp_payload = (payload as usize).clamp(MIN_UDP_PAYLOAD, MAX_UDP_PAYLOAD);
        }

        if request.opcode != 0 {
            response.rcode = RCODE_NOTIMP;
            return response;
        }
        if request.questions.len() != 1 {
            response.rcode = RCODE_FORMERR;
            return response;
        }
        let question = request.questions.into_iter().next().expect("one question");

        if question.qclass != CLASS_IN {
            response.rcode = RCODE_REFUSED;
            response.question = Some(question);
            return response;
        }

        let Some(services) = self.classify_name(&question.name) else {
            response.rcode = RCODE_REFUSED;
            response.question = Some(question);
            return response;
        };

        match question.qtype {
            TYPE_A => {
                response.answers = self.address_answers(IpFamily::V4, services);
            }
            TYPE_AAAA => {
                response.answers = self.address_answers(IpFamily::V6, services);
            }
            TYPE_NS => {
                response.answers = vec![Record {
                    ttl: NS_TTL,
                    data: RData::Ns(self.nameserver.clone()),
                }];
            }
            TYPE_SOA | TYPE_ANY => {
                response.answers = vec![self.soa_record()];
            }
            _ => {
                // Standard no-data answer: empty, SOA in authority.
                response.authority = vec![self.soa_record()];
            }
        }

        response.question = Some(question);
        response
    }

    /// Resolve a query name against the zone. Returns the services the
    /// response must filter on, or `None` when the name is out of zone.
    fn classify_name(&self, name: &str) -> Option<ServiceFlags> {
        let name = name.trim_end_matches('.');
        if name == self.zone {
            return Some(self.default_services);
        }

        let suffix = format!(".{}", self.zone);
        let prefix = name.strip_suffix(&suffix)?;

        // A single x<decimal> label overrides the default service bits.
        // Anything else below the zone behaves like the apex.
        if !prefix.contains('.') {
            if let Some(digits) = prefix.strip_prefix('x') {
                if !digits.is_empty() {
                    if let Ok(bits) = digits.parse::<u64>() {
                        return Some(ServiceFlags(bits));
                    }
                }
            }
        }
        Some(self.default_services)
    }

    fn address_answers(&self, family: IpFamily, services: ServiceFlags) -> Vec<Record> {
        // The sample is taken before any response bytes are written, so
        // no table lock is held while the reply goes out.
        let sample =
            self.manager
                .good_addresses(family, services, self.subnetwork_filter, MAX_ANSWERS);

        sample
            .into_iter()
            .map(|addr| Record {
                ttl: ADDRESS_TTL,
                data: match addr.canonical_ip() {
                    IpAddr::V4(ip) => RData::A(ip),
                    IpAddr::V6(ip) => RData::Aaaa(ip),
                },
            })
            .collect()
    }

    fn soa_record(&self) -> Record {
        Record {
            ttl: NS_TTL,
            data: RData::Soa(SoaData {
                mname: self.nameserver.clone(),
                rname: self.soa_rname.clone(),
                serial: unix_now() as u32,
                refresh: SOA_REFRESH,
                retry: SOA_RETRY,
                expire: SOA_EXPIRE,
                minimum: SOA_MINIMUM,
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::NetAddress;
    use std::net::Ipv4Addr;

    const ZONE: &str = "seed.sedranet.org";

    fn test_handler() -> (DnsHandler, Arc<AddressManager>) {
        let dir = tempfile::tempdir().unwrap();
        let metrics = Arc::new(Metrics::new());
        let manager = Arc::new(AddressManager::new(
            dir.path().join("peers.bin"),
            metrics.clone(),
        ));
        let config = Config::default()
            .with_host(ZONE.to_string())
            .with_nameserver("ns1.sedranet.org".to_string());
        let handler = DnsHandler::new(manager.clone(), metrics, &config);
        (handler, manager)
    }

    fn fill_good(manager: &AddressManager, count: u8, services: ServiceFlags) {
        for i in 1..=count {
            let addr = NetAddress::new(IpAddr::V4(Ipv4Addr::new(40, 1, services.0 as u8, i)), 16511);
            manager.good(&addr, services, SubnetworkId::SUPPORTS_ALL);
        }
    }

    fn ask(handler: &DnsHandler, name: &str, qtype: u16) -> Response {
        let packet = super::super::message::tests::build_query(0x42, name, qtype, None);
        handler.handle(&packet).expect("response expected")
    }

    #[test]
    fn test_apex_a_query_samples_sixteen() {
        let (handler, manager) = test_handler();
        fill_good(&manager, 100, ServiceFlags::NETWORK);

        let response = ask(&handler, ZONE, TYPE_A);
        assert_eq!(response.rcode, RCODE_NOERROR);
        assert_eq!(response.answers.len(), MAX_ANSWERS);
        for record in &response.answers {
            assert_eq!(record.ttl, ADDRESS_TTL);
            assert!(matches!(record.data, RData::A(_)));
        }
    }

    #[test]
    fn test_empty_store_answers_noerror() {
        let (handler, _manager) = test_handler();
        let response = ask(&handler, ZONE, TYPE_A);
        assert_eq!(response.rcode, RCODE_NOERROR);
        assert!(response.answers.is_empty());
    }

    #[test]
    fn test_service_flag_subdomain() {
        let (handler, manager) = test_handler();
        // 0x05 = NETWORK | BLOOM bits 0 and 2.
        fill_good(&manager, 4, ServiceFlags(0x05));
        fill_good(&manager, 4, ServiceFlags::NETWORK);

        let response = ask(&handler, &format!("x5.{ZONE}"), TYPE_A);
        assert_eq!(response.answers.len(), 4);

        // The plain-NETWORK peers only show up without the x5 filter.
        let response = ask(&handler, ZONE, TYPE_A);
        assert_eq!(response.answers.len(), 8);
    }

    #[test]
    fn test_unrecognized_prefix_falls_back_to_apex() {
        let (handler, manager) = test_handler();
        fill_good(&manager, 3, ServiceFlags::NETWORK);

        for name in [format!("foo.{ZONE}"), format!("xabc.{ZONE}"), format!("x.{ZONE}")] {
            let response = ask(&handler, &name, TYPE_A);
            assert_eq!(response.rcode, RCODE_NOERROR);
            assert_eq!(response.answers.len(), 3, "{name}");
        }
    }

    #[test]
    fn test_out_of_zone_is_refused() {
        let (handler, _manager) = test_handler();

        for name in ["foo.bar.example.com", "sedranet.org", "eed.sedranet.org"] {
            let response = ask(&handler, name, TYPE_A);
            assert_eq!(response.rcode, RCODE_REFUSED, "{name}");
            assert!(response.answers.is_empty());
        }
    }

    #[test]
    fn test_zone_match_is_case_insensitive() {
        let (handler, manager) = test_handler();
        fill_good(&manager, 2, ServiceFlags::NETWORK);

        let response = ask(&handler, "SEED.SedraNet.ORG", TYPE_A);
        assert_eq!(response.rcode, RCODE_NOERROR);
        assert_eq!(response.answers.len(), 2);
    }

    #[test]
    fn test_ns_at_apex() {
        let (handler, _manager) = test_handler();
        let response = ask(&handler, ZONE, TYPE_NS);

        assert_eq!(response.answers.len(), 1);
        let record = &response.answers[0];
        assert_eq!(record.ttl, NS_TTL);
        assert_eq!(record.data, RData::Ns("ns1.sedranet.org".to_string()));
    }

    #[test]
    fn test_soa_and_any() {
        let (handler, _manager) = test_handler();

        for qtype in [TYPE_SOA, TYPE_ANY] {
            let response = ask(&handler, ZONE, qtype);
            assert_eq!(response.answers.len(), 1);
            match &response.answers[0].data {
                RData::Soa(soa) => {
                    assert_eq!(soa.mname, "ns1.sedranet.org");
                    assert_eq!(soa.rname, format!("hostmaster.{ZONE}"));
                    assert!(soa.serial > 1_700_000_000);
                }
                other => panic!("expected SOA, got {other:?}"),
            }
        }
    }

    #[test]
    fn test_other_types_get_soa_authority() {
        let (handler, _manager) = test_handler();
        // TXT = 16.
        let response = ask(&handler, ZONE, 16);

        assert_eq!(response.rcode, RCODE_NOERROR);
        assert!(response.answers.is_empty());
        assert_eq!(response.authority.len(), 1);
        assert!(matches!(response.authority[0].data, RData::Soa(_)));
    }

    #[test]
    fn test_multi_question_is_formerr() {
        let (handler, _manager) = test_handler();

        let mut packet = super::super::message::tests::build_query(7, ZONE, TYPE_A, None);
        // Bump qdcount to 2 and append a second question.
        packet[5] = 2;
        let tail = packet.split_off(12);
        packet.extend_from_slice(&tail);
        packet.extend_from_slice(&tail);

        let response = handler.handle(&packet).unwrap();
        assert_eq!(response.rcode, RCODE_FORMERR);
    }

    #[test]
    fn test_aaaa_returns_only_v6() {
        let (handler, manager) = test_handler();
        fill_good(&manager, 3, ServiceFlags::NETWORK);
        let v6 = NetAddress::new("2001:db8::7".parse().unwrap(), 16511);
        manager.good(&v6, ServiceFlags::NETWORK, SubnetworkId::SUPPORTS_ALL);

        let response = ask(&handler, ZONE, TYPE_AAAA);
        assert_eq!(response.answers.len(), 1);
        assert!(matches!(response.answers[0].data, RData::Aaaa(_)));
    }

    #[test]
    fn test_garbage_packet_gets_formerr_or_drop() {
        let (handler, _manager) = test_handler();

        // Too short to echo: dropped.
        assert!(handler.handle(&[0u8]).is_none());

        // Header readable but question mangled: FORMERR.
        let mut packet = super::super::message::tests::build_query(3, ZONE, TYPE_A, None);
        packet.truncate(14);
        let response = handler.handle(&packet).unwrap();
        assert_eq!(response.rcode, RCODE_FORMERR);
    }
}
