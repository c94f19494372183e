use tracing::warn;

/// Named prompt sets. `short` stresses decode, `long` stresses prefill,
/// `mixed` spreads prompt lengths so TTFT and throughput both move.
const SETS: &[(&str, &[&str])] = &[
    (
        "mixed",
        &[
            "Name three uses of a hash map.",
            "Summarise how TCP congestion control reacts to packet loss.",
            "List the planets of the solar system with one fact about each.",
            "Translate 'the build is green again' into French and German.",
            "Explain the difference between latency and throughput for a web service.",
        ],
    ),
    (
        "short",
        &[
            "Say hello.",
            "What is 12 squared?",
            "Give one synonym for fast.",
            "Name a prime number above 50.",
        ],
    ),
    (
        "long",
        &[
            "Read the following incident note and list the root cause, the impact \
             and two follow-up actions.\n\n\
             At 02:14 UTC the primary inference node began rejecting requests after \
             its request queue filled. The queue grew because a deploy earlier that \
             evening halved the configured batch size while traffic stayed flat. \
             Latency at the load balancer rose from 300 ms to over 9 s before the \
             health checks failed and traffic shifted to the secondary node, which \
             then saturated within four minutes. The on-call engineer restored the \
             previous batch size at 02:41 and both nodes recovered by 02:50. Roughly \
             18 percent of requests in the window returned errors or timed out.",
            "Rewrite this paragraph for a non-technical reader, keeping every fact.\n\n\
             A key-value cache stores the attention keys and values computed for \
             earlier tokens so that each new token only attends over stored tensors \
             instead of recomputing the whole prefix. The cache grows linearly with \
             sequence length and batch size, so serving engines page it in fixed \
             blocks, evict finished sequences eagerly and sometimes quantise it to \
             fit more concurrent requests into the same accelerator memory.",
        ],
    ),
    (
        "coding",
        &[
            "Write a function that checks whether a string is a palindrome, ignoring case.",
            "Implement a token bucket rate limiter with a refill rate and capacity.",
            "Show a SQL query returning the five most recent orders per customer.",
        ],
    ),
    (
        "reasoning",
        &[
            "A queue serves 40 requests per second and receives 50. How long until 600 are waiting?",
            "If every engineer reviews two pull requests a day and the team opens 18, how many engineers are needed?",
            "Three servers answer in 120 ms, 80 ms and 200 ms. Requests go to all three and the first reply wins. What is the latency?",
        ],
    ),
];

pub const DEFAULT_SET: &str = "mixed";

pub fn set_names() -> Vec<&'static str> {
    SETS.iter().map(|(name, _)| *name).collect()
}

/// Prompts of the named set; unknown names fall back to the default set.
pub fn get_prompts(set: &str) -> Vec<String> {
    let prompts = SETS
        .iter()
        .find(|(name, _)| *name == set)
        .or_else(|| {
            warn!(set, known = ?set_names(), "Unknown prompt set, using {}", DEFAULT_SET);
            SETS.iter().find(|(name, _)| *name == DEFAULT_SET)
        })
        .map_or(&[][..], |(_, prompts)| *prompts);
    prompts.iter().map(|p| p.to_string()).collect()
}
